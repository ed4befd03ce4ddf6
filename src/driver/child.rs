//! Privileged RPC child: forks, chroots into the driver root, drops
//! privileges, `dlopen`s the vendor libraries, and serves requests.
//!
//! Grounded on `original_source/src/driver.c`'s `setup_rpc_service`:
//! preloads glibc libraries before `chroot` to avoid symbol mismatches,
//! drops privileges, resets the CUDA environment, arms
//! `PR_SET_PDEATHSIG`, then loads `libcuda.so.1`/`libnvidia-ml.so.1` and
//! serves forever. A bounded slab replaces the original's raw
//! `nvmlDevice_t`/pointer handles.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::Path;

use libloading::Library;
use nix::unistd::{Gid, Uid};

use crate::consts::MAX_DEVICE_HANDLES;
use crate::error::{NvcError, Result};

use super::ffi;
use super::rpc::{read_frame, write_frame, DeviceHandle, Request, Response};

const SONAME_LIBCUDA: &str = "libcuda.so.1";
const SONAME_LIBNVML: &str = "libnvidia-ml.so.1";

const RESET_ENV: &[(&str, Option<&str>)] = &[
    ("CUDA_DISABLE_UNIFIED_MEMORY", Some("1")),
    ("CUDA_CACHE_DISABLE", Some("1")),
    ("CUDA_DEVICE_ORDER", Some("PCI_BUS_ID")),
    ("CUDA_VISIBLE_DEVICES", None),
    ("CUDA_MPS_PIPE_DIRECTORY", Some("/dev/null")),
];

fn reset_cuda_environment() {
    for (name, value) in RESET_ENV {
        match value {
            Some(v) => std::env::set_var(name, v),
            None => std::env::remove_var(name),
        }
    }
}

/// One resolved GPU: its CUDA device ordinal handle, its paired NVML
/// device handle, and the busid string used to pair them. Neither raw
/// handle ever crosses the RPC boundary — only the slab index does.
struct Entry {
    busid: String,
    cuda: ffi::CuDevice,
    nvml: ffi::NvmlDevice,
}

struct Slab {
    entries: Vec<Entry>,
}

impl Slab {
    fn new() -> Self {
        Slab { entries: Vec::new() }
    }

    fn insert(&mut self, busid: String, cuda: ffi::CuDevice, nvml: ffi::NvmlDevice) -> Result<DeviceHandle> {
        if self.entries.len() >= MAX_DEVICE_HANDLES {
            return Err(NvcError::driver("device handle allocation failed", "slab exhausted"));
        }
        self.entries.push(Entry { busid, cuda, nvml });
        Ok(DeviceHandle((self.entries.len() - 1) as u32))
    }

    fn get(&self, handle: DeviceHandle) -> Result<&Entry> {
        self.entries
            .get(handle.0 as usize)
            .ok_or_else(|| NvcError::driver("device handle lookup failed", "unknown handle"))
    }
}

/// Entry point run inside the forked child. Never returns; exits the
/// process directly, matching `setup_rpc_service`'s `_exit(rv)`.
pub fn run(mut stream: UnixStream, root: &Path, uid: Uid, gid: Gid, drop_groups: bool, parent_pid: i32) -> ! {
    let rv = serve(&mut stream, root, uid, gid, drop_groups, parent_pid);
    if let Err(e) = &rv {
        log::error!("could not start driver service: {}", e.message);
    }
    std::process::exit(if rv.is_ok() { 0 } else { 1 });
}

fn serve(stream: &mut UnixStream, root: &Path, uid: Uid, gid: Gid, drop_groups: bool, parent_pid: i32) -> Result<()> {
    unsafe { libc::prctl(libc::PR_SET_NAME, c"nvc:[driver]".as_ptr() as libc::c_ulong, 0, 0, 0) };

    if root != Path::new("/") {
        // Preload glibc libraries so symbol resolution survives the chroot.
        for soname in ["libm.so.6", "librt.so.1", "libpthread.so.0"] {
            unsafe { Library::new(soname) }.map_err(|e| NvcError::driver("change root failed", e))?;
        }
        nix::unistd::chroot(root).map_err(|e| NvcError::io("change root failed", e))?;
        std::env::set_current_dir("/").map_err(|e| NvcError::io("change root failed", e))?;
    }

    crate::caps::drop_privileges(uid, gid, drop_groups)?;
    crate::caps::set_effective(&[])?;
    reset_cuda_environment();

    let rv = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) };
    if rv < 0 {
        return Err(NvcError::protocol("process initialization failed", std::io::Error::last_os_error()));
    }
    if unsafe { libc::getppid() } != parent_pid {
        unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    }

    let cuda = unsafe { Library::new(SONAME_LIBCUDA) }.map_err(|e| NvcError::driver("library load failed", e))?;
    let nvml = unsafe { Library::new(SONAME_LIBNVML) }.map_err(|e| NvcError::driver("library load failed", e))?;
    ffi::cu_init(&cuda)?;
    ffi::nvml_init(&nvml)?;

    log::info!("starting driver service");
    let mut slab = Slab::new();
    let mut busid_index: HashMap<u32, DeviceHandle> = HashMap::new();

    loop {
        let req: Request = match read_frame(stream) {
            Ok(r) => r,
            Err(_) => break, // parent closed the socket
        };
        let resp = dispatch(&req, &cuda, &nvml, &mut slab, &mut busid_index);
        let shutdown = matches!(req, Request::Shutdown);
        write_frame(stream, &resp)?;
        if shutdown {
            break;
        }
    }

    let _ = ffi::nvml_shutdown(&nvml);
    log::info!("terminating driver service");
    Ok(())
}

fn dispatch(req: &Request, cuda: &Library, nvml: &Library, slab: &mut Slab, busid_index: &mut HashMap<u32, DeviceHandle>) -> Response {
    match dispatch_inner(req, cuda, nvml, slab, busid_index) {
        Ok(r) => r,
        Err(e) => Response::Error { message: e.message },
    }
}

/// Each arm calls straight into the already-`dlopen`ed `cuda`/`nvml`
/// libraries via [`ffi`]'s typed wrappers, mirroring
/// `original_source/src/driver.c`'s `call_cuda`/`call_nvml` macros one
/// handler at a time.
fn dispatch_inner(req: &Request, cuda: &Library, nvml: &Library, slab: &mut Slab, busid_index: &mut HashMap<u32, DeviceHandle>) -> Result<Response> {
    match req {
        Request::Init => Ok(Response::Ack),
        Request::Shutdown => Ok(Response::Ack),
        Request::GetRmVersion => Ok(Response::RmVersion(ffi::nvml_system_get_driver_version(nvml)?)),
        Request::GetCudaVersion => {
            let (major, minor) = ffi::cu_driver_get_version(cuda)?;
            Ok(Response::CudaVersion { major, minor })
        }
        Request::GetDeviceCount => Ok(Response::DeviceCount(ffi::nvml_device_get_count(nvml)?)),
        Request::GetDevice { index } => {
            if let Some(handle) = busid_index.get(index) {
                return Ok(Response::Device(*handle));
            }
            let cu_dev = ffi::cu_device_get(cuda, *index)?;
            let busid = ffi::cu_device_busid(cuda, cu_dev)?;
            let nvml_dev = ffi::nvml_device_get_handle_by_pci_bus_id(nvml, &busid)?;
            let handle = slab.insert(busid, cu_dev, nvml_dev)?;
            busid_index.insert(*index, handle);
            Ok(Response::Device(handle))
        }
        Request::GetDeviceMinor { dev } => {
            let entry = slab.get(*dev)?;
            Ok(Response::Minor(ffi::nvml_device_get_minor_number(nvml, entry.nvml)?))
        }
        Request::GetDeviceBusid { dev } => Ok(Response::Busid(slab.get(*dev)?.busid.clone())),
        Request::GetDeviceUuid { dev } => {
            let entry = slab.get(*dev)?;
            Ok(Response::Uuid(ffi::nvml_device_get_uuid(nvml, entry.nvml)?))
        }
        Request::GetDeviceArch { dev } => {
            let entry = slab.get(*dev)?;
            Ok(Response::Arch(ffi::cu_device_arch(cuda, entry.cuda)?))
        }
        Request::GetDeviceModel { dev } => {
            let entry = slab.get(*dev)?;
            Ok(Response::Model(ffi::nvml_device_get_name(nvml, entry.nvml)?))
        }
        Request::GetDeviceBrand { dev } => {
            let entry = slab.get(*dev)?;
            Ok(Response::Brand(ffi::nvml_device_get_brand(nvml, entry.nvml)?.as_str().to_string()))
        }
    }
}
