//! Driver/device information assembly (C6).
//!
//! Grounded on `original_source/src/nvc_info.c`: combines the RPC
//! version/device queries ([`crate::driver`]) with `ld.so.cache`
//! resolution ([`crate::ldcache`]) and `$PATH`/procfs probing to build
//! the full inventory of binaries, libraries, device nodes, and IPC
//! sockets that later feed the mount plan (C8).

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::consts::{self, libraries};
use crate::driver::Driver;
use crate::elf::{AbiTag, ElfTool};
use crate::error::{NvcError, Result};
use crate::fs::path::{path_resolve, path_resolve_full};
use crate::ldcache::{LdArch, LdCache};
use crate::options::DriverOpts;

/// A character/block device the container needs mounted in.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub rdev: u64,
}

/// Full driver inventory resolved against a given rootfs.
#[derive(Debug, Clone, Default)]
pub struct DriverInfo {
    pub nvrm_version: String,
    pub cuda_version: String,
    pub bins: Vec<PathBuf>,
    pub libs: Vec<PathBuf>,
    pub libs32: Vec<PathBuf>,
    pub devices: Vec<DeviceNode>,
    pub ipcs: Vec<PathBuf>,
}

/// The new-ABI tag libnvidia-tls.so must carry to be selected, per
/// `select_libraries`'s `{0x02, 0x03, 0x63}` check.
const TLS_ABI: AbiTag = [0x02, 0x03, 0x63];

pub fn driver_info_new(driver: &mut Driver, root: &Path, ldcache: &Path, opts: &DriverOpts) -> Result<DriverInfo> {
    let nvrm_version = driver.get_rm_version()?;
    let cuda_version = driver.get_cuda_version()?;

    log::info!("requesting driver information with '{opts:?}'");

    let mut libs_wanted: Vec<&str> = Vec::new();
    libs_wanted.extend_from_slice(libraries::UTILITY);
    libs_wanted.extend_from_slice(libraries::COMPUTE);
    libs_wanted.extend_from_slice(libraries::VIDEO);
    libs_wanted.extend_from_slice(libraries::GRAPHICS);
    if opts.no_glvnd {
        libs_wanted.extend_from_slice(libraries::GRAPHICS_COMPAT);
    } else {
        libs_wanted.extend_from_slice(libraries::GRAPHICS_GLVND);
    }

    let (libs, libs32) = find_library_paths(root, ldcache, &libs_wanted, &nvrm_version)?;

    let mut bins_wanted: Vec<&str> = Vec::new();
    bins_wanted.extend_from_slice(consts::binaries::UTILITY);
    if !opts.no_mps {
        bins_wanted.extend_from_slice(consts::binaries::COMPUTE);
    }
    let bins = find_binary_paths(root, &bins_wanted)?;

    let devices = lookup_devices(root, opts)?;
    let ipcs = lookup_ipcs(root, opts)?;

    Ok(DriverInfo {
        nvrm_version,
        cuda_version,
        bins,
        libs,
        libs32,
        devices,
        ipcs,
    })
}

/// Resolves `libs` both in the native cache (`x86_64`) and compat32
/// cache (`i386`), applying `select_libraries`'s version/ABI/ownership
/// filters. Entries that fail selection or are missing are dropped
/// (the original's `array_pack` compaction).
fn find_library_paths(root: &Path, ldcache: &Path, libs: &[&str], nvrm_version: &str) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let ldcache_full = path_resolve_full(root, ldcache)?;
    let cache = LdCache::open(&ldcache_full)?;

    let resolved64 = cache.resolve(root, LdArch::X8664_LIB64, libs)?;
    let resolved32 = cache.resolve(root, LdArch::I386_LIB32, libs)?;

    let libs64 = filter_selected(root, resolved64, nvrm_version);
    let libs32 = filter_selected(root, resolved32, nvrm_version);

    for (i, lib) in libs.iter().enumerate() {
        if i >= libs64.len() {
            log::warn!("missing library {lib}");
        }
    }
    Ok((libs64, libs32))
}

fn filter_selected(root: &Path, candidates: Vec<Option<PathBuf>>, nvrm_version: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for candidate in candidates.into_iter().flatten() {
        if select_library(root, &candidate, nvrm_version) {
            out.push(candidate);
        }
    }
    out
}

/// Mirrors `select_libraries`: ABI check for `libnvidia-tls.so`, driver
/// version suffix check, and GLVND-ownership check for the compat libs.
fn select_library(root: &Path, path: &Path, nvrm_version: &str) -> bool {
    let Ok(bytes) = std::fs::read(path) else { return false };
    let Ok(et) = ElfTool::parse(path, &bytes) else { return false };

    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if basename.starts_with("libnvidia-tls.so") && !et.has_abi(TLS_ABI) {
        return false;
    }
    if !basename.ends_with(nvrm_version) {
        return false;
    }
    if libraries::GRAPHICS_COMPAT.iter().any(|prefix| basename.starts_with(prefix.trim_end_matches(".so"))) {
        return et.has_dependency("libnvidia-glcore.so") || et.has_dependency("libnvidia-eglcore.so");
    }
    let _ = root;
    true
}

/// Walks `$PATH` looking for each wanted binary basename, resolving each
/// candidate below `root` the way `find_binary_paths` does.
fn find_binary_paths(root: &Path, bins: &[&str]) -> Result<Vec<PathBuf>> {
    let path_var = std::env::var_os("PATH").ok_or_else(|| NvcError::missing("environment variable PATH", "not found"))?;
    let mut found = vec![None; bins.len()];

    for dir in std::env::split_paths(&path_var) {
        let dir = if dir.as_os_str().is_empty() { PathBuf::from(".") } else { dir };
        for (i, bin) in bins.iter().enumerate() {
            if found[i].is_some() {
                continue;
            }
            let candidate = dir.join(bin);
            if let Ok(resolved) = path_resolve(root, &candidate) {
                let full = root.join(resolved.strip_prefix("/").unwrap_or(&resolved));
                if full.exists() {
                    log::info!("selecting {}", full.display());
                    found[i] = Some(full);
                }
            }
        }
    }

    for (bin, slot) in bins.iter().zip(&found) {
        if slot.is_none() {
            log::warn!("missing binary {bin}");
        }
    }
    Ok(found.into_iter().flatten().collect())
}

fn lookup_devices(root: &Path, opts: &DriverOpts) -> Result<Vec<DeviceNode>> {
    let mut devices = vec![find_fixed_device(root, consts::NV_CTL_DEVICE_PATH, consts::NV_DEVICE_MAJOR, consts::NV_CTL_DEVICE_MINOR)?];

    if !opts.no_uvm {
        if let Some(node) = find_device_node(root, consts::NV_UVM_DEVICE_PATH)? {
            devices.push(node);
        }
        if let Some(node) = find_device_node(root, consts::NV_UVM_TOOLS_DEVICE_PATH)? {
            devices.push(node);
        }
    }
    if !opts.no_modeset {
        devices.push(find_fixed_device(root, consts::NV_MODESET_DEVICE_PATH, consts::NV_DEVICE_MAJOR, consts::NV_MODESET_DEVICE_MINOR)?);
    }

    for dev in &devices {
        log::info!("listing device {}", dev.path.display());
    }
    Ok(devices)
}

fn find_fixed_device(root: &Path, dev: &str, major: u64, minor: u64) -> Result<DeviceNode> {
    let _ = root;
    Ok(DeviceNode {
        path: PathBuf::from(dev),
        rdev: nix::sys::stat::makedev(major, minor),
    })
}

fn find_device_node(root: &Path, dev: &str) -> Result<Option<DeviceNode>> {
    let full = path_resolve_full(root, Path::new(dev))?;
    match std::fs::metadata(&full) {
        Ok(meta) => Ok(Some(DeviceNode {
            path: PathBuf::from(dev),
            rdev: meta.rdev(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("missing device {dev}");
            Ok(None)
        }
        Err(e) => Err(NvcError::io(format!("device lookup failed: {dev}"), e)),
    }
}

fn lookup_ipcs(root: &Path, opts: &DriverOpts) -> Result<Vec<PathBuf>> {
    let mut ipcs = Vec::new();
    if !opts.no_persistenced {
        if let Some(p) = find_ipc_path(root, consts::NV_PERSISTENCED_SOCKET)? {
            ipcs.push(p);
        }
    }
    if !opts.no_mps {
        let mps = std::env::var("CUDA_MPS_PIPE_DIRECTORY").unwrap_or_else(|_| consts::NV_MPS_PIPE_DIR.to_string());
        if let Some(p) = find_ipc_path(root, &mps)? {
            ipcs.push(p);
        }
    }
    Ok(ipcs)
}

fn find_ipc_path(root: &Path, ipc: &str) -> Result<Option<PathBuf>> {
    let resolved = path_resolve(root, Path::new(ipc))?;
    let full = root.join(resolved.strip_prefix("/").unwrap_or(&resolved));
    if full.exists() {
        log::info!("listing ipc {}", full.display());
        Ok(Some(resolved))
    } else {
        log::warn!("missing ipc {ipc}");
        Ok(None)
    }
}
