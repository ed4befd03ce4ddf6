//! Typed NVML/CUDA driver-API symbols resolved at runtime (C5).
//!
//! Grounded on `original_source/src/driver.c`'s `call_nvml`/`call_cuda`
//! macros and the `driver_get_*_1_svc` handlers: each function here is a
//! thin `libloading::Symbol` lookup plus the exact call signature those
//! handlers use. Buffer sizes and attribute codes are the stable values
//! published in `nvml.h`/`cuda.h` (unchanged across driver branches, so
//! safe to hardcode rather than re-derive at runtime).

use libloading::Library;

use crate::error::{NvcError, Result};

pub type NvmlDevice = *mut std::ffi::c_void;
pub type CuDevice = std::os::raw::c_int;

const NVML_SUCCESS: i32 = 0;
const CUDA_SUCCESS: i32 = 0;

const NVML_DEVICE_UUID_BUFFER_SIZE: usize = 96;
const NVML_DEVICE_NAME_BUFFER_SIZE: usize = 96;
const NVML_SYSTEM_DRIVER_VERSION_BUFFER_SIZE: usize = 80;
const NVML_DEVICE_PCI_BUS_ID_BUFFER_SIZE: usize = 32;

pub const CU_DEVICE_ATTRIBUTE_PCI_BUS_ID: i32 = 33;
pub const CU_DEVICE_ATTRIBUTE_PCI_DEVICE_ID: i32 = 34;
pub const CU_DEVICE_ATTRIBUTE_PCI_DOMAIN_ID: i32 = 50;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;

/// Mirrors `nvmlBrandType_t`; `driver_get_device_brand_1_svc` just
/// stringifies whichever of these NVML returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NvmlBrand {
    Unknown = 0,
    Quadro = 1,
    Tesla = 2,
    Nvs = 3,
    Grid = 4,
    Geforce = 5,
    Titan = 6,
}

impl NvmlBrand {
    fn from_raw(v: i32) -> Self {
        match v {
            1 => NvmlBrand::Quadro,
            2 => NvmlBrand::Tesla,
            3 => NvmlBrand::Nvs,
            4 => NvmlBrand::Grid,
            5 => NvmlBrand::Geforce,
            6 => NvmlBrand::Titan,
            _ => NvmlBrand::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NvmlBrand::Quadro => "Quadro",
            NvmlBrand::Tesla => "Tesla",
            NvmlBrand::Nvs => "NVS",
            NvmlBrand::Grid => "GRID",
            NvmlBrand::Geforce => "GeForce",
            NvmlBrand::Titan => "TITAN",
            NvmlBrand::Unknown => "Unknown",
        }
    }
}

unsafe fn symbol<'a, T>(lib: &'a Library, name: &[u8]) -> Result<libloading::Symbol<'a, T>> {
    lib.get(name).map_err(|e| NvcError::driver("driver symbol lookup failed", e))
}

fn cstr_from_buf(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn nvml_check(rv: i32, what: &str) -> Result<()> {
    if rv == NVML_SUCCESS {
        Ok(())
    } else {
        Err(NvcError::driver(what, format!("nvml call failed with code {rv}")))
    }
}

fn cuda_check(rv: i32, what: &str) -> Result<()> {
    if rv == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(NvcError::driver(what, format!("cuda call failed with code {rv}")))
    }
}

pub fn cu_init(cuda: &Library) -> Result<()> {
    type Fn = unsafe extern "C" fn(u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(cuda, b"cuInit\0") }?;
    cuda_check(unsafe { f(0) }, "cuda initialization failed")
}

pub fn nvml_init(nvml: &Library) -> Result<()> {
    type Fn = unsafe extern "C" fn() -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlInit_v2\0") }?;
    nvml_check(unsafe { f() }, "nvml initialization failed")
}

pub fn nvml_shutdown(nvml: &Library) -> Result<()> {
    type Fn = unsafe extern "C" fn() -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlShutdown\0") }?;
    nvml_check(unsafe { f() }, "nvml shutdown failed")
}

pub fn nvml_system_get_driver_version(nvml: &Library) -> Result<String> {
    type Fn = unsafe extern "C" fn(*mut u8, u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlSystemGetDriverVersion\0") }?;
    let mut buf = [0u8; NVML_SYSTEM_DRIVER_VERSION_BUFFER_SIZE];
    nvml_check(unsafe { f(buf.as_mut_ptr(), buf.len() as u32) }, "nvml version query failed")?;
    Ok(cstr_from_buf(&buf))
}

pub fn cu_driver_get_version(cuda: &Library) -> Result<(u32, u32)> {
    type Fn = unsafe extern "C" fn(*mut i32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(cuda, b"cuDriverGetVersion\0") }?;
    let mut version: i32 = 0;
    cuda_check(unsafe { f(&mut version) }, "cuda version query failed")?;
    Ok(((version / 1000) as u32, (version % 100 / 10) as u32))
}

pub fn nvml_device_get_count(nvml: &Library) -> Result<u32> {
    type Fn = unsafe extern "C" fn(*mut u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetCount_v2\0") }?;
    let mut count: u32 = 0;
    nvml_check(unsafe { f(&mut count) }, "device enumeration failed")?;
    Ok(count)
}

pub fn cu_device_get(cuda: &Library, ordinal: u32) -> Result<CuDevice> {
    type Fn = unsafe extern "C" fn(*mut CuDevice, i32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(cuda, b"cuDeviceGet\0") }?;
    let mut dev: CuDevice = 0;
    cuda_check(unsafe { f(&mut dev, ordinal as i32) }, "device lookup failed")?;
    Ok(dev)
}

fn cu_device_get_attribute(cuda: &Library, dev: CuDevice, attrib: i32) -> Result<i32> {
    type Fn = unsafe extern "C" fn(*mut i32, i32, CuDevice) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(cuda, b"cuDeviceGetAttribute\0") }?;
    let mut value: i32 = 0;
    cuda_check(unsafe { f(&mut value, attrib, dev) }, "device attribute query failed")?;
    Ok(value)
}

/// Builds the `domain:bus:device.0` busid string the same way
/// `driver_get_device_busid_1_svc` does, via three `cuDeviceGetAttribute`
/// calls.
pub fn cu_device_busid(cuda: &Library, dev: CuDevice) -> Result<String> {
    let domain = cu_device_get_attribute(cuda, dev, CU_DEVICE_ATTRIBUTE_PCI_DOMAIN_ID)?;
    let bus = cu_device_get_attribute(cuda, dev, CU_DEVICE_ATTRIBUTE_PCI_BUS_ID)?;
    let device = cu_device_get_attribute(cuda, dev, CU_DEVICE_ATTRIBUTE_PCI_DEVICE_ID)?;
    Ok(format!("{domain:08x}:{bus:02x}:{device:02x}.0"))
}

pub fn cu_device_arch(cuda: &Library, dev: CuDevice) -> Result<String> {
    let major = cu_device_get_attribute(cuda, dev, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
    let minor = cu_device_get_attribute(cuda, dev, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
    Ok(format!("{major}.{minor}"))
}

pub fn nvml_device_get_handle_by_pci_bus_id(nvml: &Library, busid: &str) -> Result<NvmlDevice> {
    type Fn = unsafe extern "C" fn(*const u8, *mut NvmlDevice) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetHandleByPciBusId_v2\0") }?;
    let mut buf = [0u8; NVML_DEVICE_PCI_BUS_ID_BUFFER_SIZE];
    let bytes = busid.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    let mut handle: NvmlDevice = std::ptr::null_mut();
    nvml_check(unsafe { f(buf.as_ptr(), &mut handle) }, "device handle lookup failed")?;
    Ok(handle)
}

pub fn nvml_device_get_minor_number(nvml: &Library, handle: NvmlDevice) -> Result<u32> {
    type Fn = unsafe extern "C" fn(NvmlDevice, *mut u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetMinorNumber\0") }?;
    let mut minor: u32 = 0;
    nvml_check(unsafe { f(handle, &mut minor) }, "device minor query failed")?;
    Ok(minor)
}

pub fn nvml_device_get_uuid(nvml: &Library, handle: NvmlDevice) -> Result<String> {
    type Fn = unsafe extern "C" fn(NvmlDevice, *mut u8, u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetUUID\0") }?;
    let mut buf = [0u8; NVML_DEVICE_UUID_BUFFER_SIZE];
    nvml_check(unsafe { f(handle, buf.as_mut_ptr(), buf.len() as u32) }, "device uuid query failed")?;
    Ok(cstr_from_buf(&buf))
}

pub fn nvml_device_get_name(nvml: &Library, handle: NvmlDevice) -> Result<String> {
    type Fn = unsafe extern "C" fn(NvmlDevice, *mut u8, u32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetName\0") }?;
    let mut buf = [0u8; NVML_DEVICE_NAME_BUFFER_SIZE];
    nvml_check(unsafe { f(handle, buf.as_mut_ptr(), buf.len() as u32) }, "device name query failed")?;
    Ok(cstr_from_buf(&buf))
}

pub fn nvml_device_get_brand(nvml: &Library, handle: NvmlDevice) -> Result<NvmlBrand> {
    type Fn = unsafe extern "C" fn(NvmlDevice, *mut i32) -> i32;
    let f: libloading::Symbol<Fn> = unsafe { symbol(nvml, b"nvmlDeviceGetBrand\0") }?;
    let mut brand: i32 = 0;
    nvml_check(unsafe { f(handle, &mut brand) }, "device brand query failed")?;
    Ok(NvmlBrand::from_raw(brand))
}
