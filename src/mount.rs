//! Driver and device injection into a container rootfs (C8).
//!
//! Grounded on `original_source/src/nvc_mount.c`: enters the target
//! container's mount namespace, bind-mounts the driver's binaries,
//! libraries, device nodes and IPC sockets into it, and returns to the
//! caller's namespace. The original rolls back a failed
//! plan by reverse-iterating a flat array of mountpoint strings and
//! `goto fail`; here [`MountGuard`] accumulates mountpoints as they are
//! made and unwinds them on any error, without a rewritten control flow
//! at each call site.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::stat::{major, minor};
use nix::unistd::{Gid, Uid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::{self, binaries, libraries};
use crate::container::Container;
use crate::device::DeviceInfo;
use crate::error::{IoContext, NvcError, Result};
use crate::fs::file::{self, NodeKind};
use crate::fs::mount as mnt;
use crate::fs::path::path_resolve_full;
use crate::info::{DeviceNode, DriverInfo};
use crate::options::ContainerFlags;

const SONAME_LIBCUDA: &str = "libcuda.so.1";
const GLX_INDIRECT_NAME: &str = "libGLX_indirect.so.0";
const OPTICALFLOW_SONAME: &str = "libnvidia-opticalflow.so.1";
const OPTICALFLOW_NAME: &str = "libnvidia-opticalflow.so";
const APP_PROFILE_FILE: &str = "10-container.conf";

/// Rollback accumulator: every mountpoint pushed here is detach-unmounted
/// and removed, in reverse order, if the surrounding plan fails.
#[derive(Default)]
struct MountGuard {
    mounts: Vec<PathBuf>,
}

impl MountGuard {
    fn track(&mut self, path: PathBuf) {
        self.mounts.push(path);
    }

    fn rollback(&self) {
        for path in self.mounts.iter().rev() {
            let _ = mnt::umount_detach(path);
            let _ = file::remove(path);
        }
    }

    /// No-op: the mounts already stand: committing just means not rolling
    /// them back.
    fn commit(self) {}
}

fn file_mode(path: &Path) -> Result<u32> {
    std::fs::metadata(path)
        .map(|m| m.permissions().mode())
        .io_context(format!("stat failed: {}", path.display()))
}

fn matches_binary(basename: &str, flags: ContainerFlags) -> bool {
    if flags.contains(ContainerFlags::UTILITY_BINS) && binaries::UTILITY.iter().any(|p| basename.starts_with(p)) {
        return true;
    }
    if flags.contains(ContainerFlags::COMPUTE_BINS) && binaries::COMPUTE.iter().any(|p| basename.starts_with(p)) {
        return true;
    }
    false
}

fn matches_library(basename: &str, flags: ContainerFlags) -> bool {
    if flags.contains(ContainerFlags::UTILITY_LIBS) && libraries::UTILITY.iter().any(|p| basename.starts_with(p)) {
        return true;
    }
    if flags.contains(ContainerFlags::COMPUTE_LIBS) && libraries::COMPUTE.iter().any(|p| basename.starts_with(p)) {
        return true;
    }
    if flags.contains(ContainerFlags::VIDEO_LIBS) && libraries::VIDEO.iter().any(|p| basename.starts_with(p)) {
        return true;
    }
    if flags.contains(ContainerFlags::GRAPHICS_LIBS)
        && (libraries::GRAPHICS.iter().any(|p| basename.starts_with(p))
            || libraries::GRAPHICS_GLVND.iter().any(|p| basename.starts_with(p))
            || libraries::GRAPHICS_COMPAT.iter().any(|p| basename.starts_with(p)))
    {
        return true;
    }
    false
}

/// Bind-mounts every `src` in `srcs` whose basename matches the
/// container's requested capabilities into `dir` below the container
/// rootfs, read-only. Mirrors `mount_files`; `srcs` are already
/// host-visible absolute paths (as produced by [`crate::info`] and
/// [`crate::container`]).
fn mount_files(cnt: &Container, dir: &Path, srcs: &[PathBuf], guard: &mut MountGuard) -> Result<Vec<PathBuf>> {
    let dst_dir = path_resolve_full(&cnt.rootfs, dir)?;
    file::create(&dst_dir, NodeKind::Directory, None, cnt.uid, cnt.gid, 0o755)?;

    let mut mounted = Vec::new();
    for src in srcs {
        let basename = src.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !matches_binary(basename, cnt.flags) && !matches_library(basename, cnt.flags) {
            continue;
        }
        let dst = dst_dir.join(basename);
        let mode = file_mode(src)?;
        file::create(&dst, NodeKind::Regular, None, cnt.uid, cnt.gid, mode)?;

        log::info!("mounting {} at {}", src.display(), dst.display());
        mnt::mount(Some(src.as_path()), &dst, None, MsFlags::MS_BIND, None)?;
        guard.track(dst.clone());
        mnt::mount(
            None,
            &dst,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            None,
        )?;
        mounted.push(dst);
    }
    Ok(mounted)
}

/// Bind-mounts a single device node, matching `mount_device`. The node's
/// `rdev` is checked against the host node before mounting, so a stale
/// [`DeviceNode`] can never bind an unrelated device.
fn mount_device(root: &Path, cnt: &Container, node: &DeviceNode, guard: &mut MountGuard) -> Result<PathBuf> {
    let rel = node.path.strip_prefix("/").unwrap_or(node.path.as_path());
    let src = root.join(rel);
    let dst = path_resolve_full(&cnt.rootfs, &node.path)?;

    let meta = std::fs::metadata(&src).io_context(format!("stat failed: {}", src.display()))?;
    if meta.rdev() != node.rdev {
        return Err(NvcError::invalid("invalid device node", src.display()));
    }
    file::create(&dst, NodeKind::Regular, None, cnt.uid, cnt.gid, meta.permissions().mode())?;

    log::info!("mounting {} at {}", src.display(), dst.display());
    mnt::mount(Some(src.as_path()), &dst, None, MsFlags::MS_BIND, None)?;
    guard.track(dst.clone());
    mnt::mount(
        None,
        &dst,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    Ok(dst)
}

/// Bind-mounts an IPC socket/directory, matching `mount_ipc`. Unlike
/// library and device mounts this one stays writable.
fn mount_ipc(root: &Path, cnt: &Container, ipc: &Path, guard: &mut MountGuard) -> Result<PathBuf> {
    let rel = ipc.strip_prefix("/").unwrap_or(ipc);
    let src = root.join(rel);
    let dst = path_resolve_full(&cnt.rootfs, ipc)?;
    let mode = file_mode(&src)?;
    file::create(&dst, NodeKind::Regular, None, cnt.uid, cnt.gid, mode)?;

    log::info!("mounting {} at {}", src.display(), dst.display());
    mnt::mount(Some(src.as_path()), &dst, None, MsFlags::MS_BIND, None)?;
    guard.track(dst.clone());
    mnt::mount(
        None,
        &dst,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    Ok(dst)
}

/// Mounts an empty, read-only tmpfs over the application-profile
/// directory so `update_app_profile` can populate it without touching
/// the host's own profiles, matching `mount_app_profile`.
fn mount_app_profile(cnt: &Container, guard: &mut MountGuard) -> Result<PathBuf> {
    let dst = path_resolve_full(&cnt.rootfs, Path::new(consts::NV_APP_PROFILE_DIR))?;
    file::create(&dst, NodeKind::Directory, None, cnt.uid, cnt.gid, 0o555)?;

    log::info!("mounting tmpfs at {}", dst.display());
    mnt::mount(Some(Path::new("tmpfs")), &dst, Some("tmpfs"), MsFlags::empty(), Some("mode=0555"))?;
    guard.track(dst.clone());
    mnt::mount(
        None,
        &dst,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    Ok(dst)
}

/// Recreates `/proc/driver/nvidia/{params,version,registry}` under a
/// fresh tmpfs, rewriting `ModifyDeviceFiles: 1` to `0` in `params` so
/// the in-container driver never adjusts host device nodes. Matches
/// `mount_procfs`.
fn mount_procfs(root: &Path, cnt: &Container, guard: &mut MountGuard) -> Result<PathBuf> {
    let dst_dir = path_resolve_full(&cnt.rootfs, Path::new(consts::NV_PROC_DRIVER))?;

    log::info!("mounting tmpfs at {}", dst_dir.display());
    mnt::mount(Some(Path::new("tmpfs")), &dst_dir, Some("tmpfs"), MsFlags::empty(), Some("mode=0555"))?;
    guard.track(dst_dir.clone());

    let src_dir = root.join(consts::NV_PROC_DRIVER.trim_start_matches('/'));
    for name in ["params", "version", "registry"] {
        let src = src_dir.join(name);
        let meta = match std::fs::metadata(&src) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(NvcError::io(format!("stat failed: {}", src.display()), e)),
        };
        let mut contents = std::fs::read_to_string(&src).io_context(format!("read error: {}", src.display()))?;
        if name == "params" {
            contents = contents.replacen("ModifyDeviceFiles: 1", "ModifyDeviceFiles: 0", 1);
        }
        let dst = dst_dir.join(name);
        file::create(&dst, NodeKind::Regular, Some(&contents), cnt.uid, cnt.gid, meta.permissions().mode())?;
    }

    mnt::mount(
        None,
        &dst_dir,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    Ok(dst_dir)
}

/// Binds a single GPU's `/proc/driver/nvidia/gpus/<busid>` entry,
/// probing both the 32-bit and 16-bit PCI domain spellings the driver
/// procfs has used across versions, matching `mount_procfs_gpu`.
fn mount_procfs_gpu(root: &Path, cnt: &Container, busid: &str, guard: &mut MountGuard) -> Result<PathBuf> {
    let mut found = None;
    for off in [0usize, 4] {
        if off > busid.len() {
            break;
        }
        let gpu_rel = format!("gpus/{}", &busid[off..]);
        let src = root.join(consts::NV_PROC_DRIVER.trim_start_matches('/')).join(&gpu_rel);
        if std::fs::metadata(&src).is_ok() {
            found = Some((src, gpu_rel));
            break;
        }
        if off != 0 {
            break;
        }
    }
    let (src, gpu_rel) = found.ok_or_else(|| NvcError::missing("gpu procfs entry", busid))?;
    let dst = path_resolve_full(&cnt.rootfs, &Path::new(consts::NV_PROC_DRIVER).join(&gpu_rel))?;
    let mode = file_mode(&src)?;
    file::create(&dst, NodeKind::Regular, None, cnt.uid, cnt.gid, mode)?;

    log::info!("mounting {} at {}", src.display(), dst.display());
    mnt::mount(Some(src.as_path()), &dst, None, MsFlags::MS_BIND, None)?;
    guard.track(dst.clone());
    mnt::mount(
        None,
        &dst,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    Ok(dst)
}

fn setup_cgroup(cgroup: &Path, rdev: u64) -> Result<()> {
    use std::io::Write;

    let path = cgroup.join("devices.allow");
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .io_context(format!("open failed: {}", path.display()))?;

    let (maj, min) = (major(rdev), minor(rdev));
    log::info!("whitelisting device node {maj}:{min}");
    write!(f, "c {maj}:{min} rw").io_context(format!("write error: {}", path.display()))?;
    f.flush().io_context(format!("write error: {}", path.display()))?;
    Ok(())
}

fn symlink_library(src: &Path, target: &str, linkname: &str, uid: Uid, gid: Gid) -> Result<()> {
    let parent = src.parent().ok_or_else(|| NvcError::invalid("symlink error", src.display()))?;
    let path = parent.join(linkname);
    log::info!("creating symlink {} -> {}", path.display(), target);
    file::create(&path, NodeKind::Symlink, Some(target), uid, gid, 0o777)
}

/// Creates the three fixed compatibility symlinks applications wrongly
/// assume exist, matching `symlink_libraries`.
fn symlink_libraries(cnt: &Container, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let lib = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if lib.starts_with("libcuda.so") {
            symlink_library(path, SONAME_LIBCUDA, "libcuda.so", cnt.uid, cnt.gid)?;
        } else if lib.starts_with("libGLX_nvidia.so") {
            symlink_library(path, lib, GLX_INDIRECT_NAME, cnt.uid, cnt.gid)?;
        } else if lib.starts_with("libnvidia-opticalflow.so") {
            symlink_library(path, OPTICALFLOW_SONAME, OPTICALFLOW_NAME, cnt.uid, cnt.gid)?;
        }
    }
    Ok(())
}

/// Drops any container-local compat library whose SONAME major version
/// equals the host driver's, since a same-major compat library only
/// risks an unsupported configuration. Matches `filter_libraries`.
fn filter_compat_libs(nvrm_version: &str, paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| {
            let lib = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            match lib.find(".so.") {
                Some(idx) => {
                    let maj = &lib[idx + 4..];
                    let digits: String = maj.chars().take_while(|c| c.is_ascii_digit()).collect();
                    nvrm_version.get(..digits.len()) != Some(digits.as_str())
                }
                None => false,
            }
        })
        .collect()
}

/// Typed mirror of the application-profile JSON format the driver
/// reads from `/etc/nvidia/nvidia-application-profiles-rc.d`.
/// The original edits this file by `strstr`/`strtoumax`
/// substitution on raw text; here it is parsed, updated, and
/// re-serialized as structured JSON.
#[derive(Debug, Serialize, Deserialize)]
struct AppProfile {
    profiles: Vec<AppProfileEntry>,
    rules: Vec<AppProfileRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppProfileEntry {
    name: String,
    settings: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppProfileRule {
    pattern: Vec<Value>,
    profile: String,
}

/// Sets bit `minor(rdev)` in the container's `EGLVisibleDGPUDevices`
/// bitmask, creating the profile if absent. Matches `update_app_profile`.
fn update_app_profile(cnt: &Container, rdev: u64) -> Result<()> {
    let path = path_resolve_full(&cnt.rootfs, Path::new(consts::NV_APP_PROFILE_DIR))?.join(APP_PROFILE_FILE);
    let bit = 1u64 << minor(rdev);

    let mask = match std::fs::read_to_string(&path) {
        Ok(text) => {
            let profile: AppProfile = serde_json::from_str(&text).map_err(|e| NvcError::parse("invalid application profile", e))?;
            let existing = profile
                .profiles
                .first()
                .and_then(|p| p.settings.get(1))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            existing | bit
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => bit,
        Err(e) => return Err(NvcError::io(format!("read error: {}", path.display()), e)),
    };

    let profile = AppProfile {
        profiles: vec![AppProfileEntry {
            name: "_container_".to_string(),
            settings: vec![Value::String("EGLVisibleDGPUDevices".to_string()), Value::from(mask)],
        }],
        rules: vec![AppProfileRule {
            pattern: vec![],
            profile: "_container_".to_string(),
        }],
    };
    let text = serde_json::to_string_pretty(&profile).map_err(|e| NvcError::parse("invalid application profile", e))?;
    file::create(&path, NodeKind::Regular, Some(&text), cnt.uid, cnt.gid, 0o555)
}

/// Injects the driver's binaries, libraries, device nodes and IPC
/// sockets into `container`, matching `nvc_driver_mount`. `caller_ns` is
/// the mount-namespace fd to return to once the plan is done (or
/// aborted); `root` is the host driver root (usually `/`).
pub fn driver_mount(caller_ns: RawFd, root: &Path, container: &Container, info: &DriverInfo) -> Result<()> {
    mnt::ns_enter(&container.mount_ns)?;

    let mut guard = MountGuard::default();
    let result = (|| -> Result<()> {
        mount_procfs(root, container, &mut guard)?;

        if container.flags.contains(ContainerFlags::GRAPHICS_LIBS) {
            mount_app_profile(container, &mut guard)?;
        }

        let mut mounted_libs = Vec::new();
        if !info.bins.is_empty() {
            mount_files(container, &container.bins_dir, &info.bins, &mut guard)?;
        }
        if !info.libs.is_empty() {
            mounted_libs.extend(mount_files(container, &container.libs_dir, &info.libs, &mut guard)?);
        }
        if container.flags.contains(ContainerFlags::COMPAT32) && !info.libs32.is_empty() {
            mounted_libs.extend(mount_files(container, &container.libs32_dir, &info.libs32, &mut guard)?);
        }
        symlink_libraries(container, &mounted_libs)?;

        if !container.compat_libs.is_empty() {
            let filtered = filter_compat_libs(&info.nvrm_version, container.compat_libs.clone());
            if !filtered.is_empty() {
                mount_files(container, &container.libs_dir, &filtered, &mut guard)?;
            }
        }

        for ipc in &info.ipcs {
            let persistenced_only = ipc.to_str() == Some(consts::NV_PERSISTENCED_SOCKET);
            if persistenced_only {
                if !container.flags.contains(ContainerFlags::UTILITY_LIBS) {
                    continue;
                }
            } else if !container.flags.contains(ContainerFlags::COMPUTE_LIBS) {
                continue;
            }
            mount_ipc(root, container, ipc, &mut guard)?;
        }

        for dev in &info.devices {
            let is_uvm = dev.path == Path::new(consts::NV_UVM_DEVICE_PATH) || dev.path == Path::new(consts::NV_UVM_TOOLS_DEVICE_PATH);
            let is_modeset = dev.path == Path::new(consts::NV_MODESET_DEVICE_PATH);
            if is_uvm && !container.flags.contains(ContainerFlags::COMPUTE_LIBS) {
                continue;
            }
            if is_modeset && !container.flags.contains(ContainerFlags::DISPLAY) {
                continue;
            }
            if !container.flags.contains(ContainerFlags::NO_DEVBIND) {
                mount_device(root, container, dev, &mut guard)?;
            }
            if !container.flags.contains(ContainerFlags::NO_CGROUPS) {
                if let Some(cgroup) = &container.device_cgroup {
                    setup_cgroup(cgroup, dev.rdev)?;
                }
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            guard.commit();
            mnt::ns_enter_at(caller_ns)?;
            Ok(())
        }
        Err(e) => {
            guard.rollback();
            let _ = mnt::ns_enter_at(caller_ns);
            Err(e)
        }
    }
}

/// Injects a single GPU's device node, procfs entry, application
/// profile bit, and cgroup allowance, matching `nvc_device_mount`.
pub fn device_mount(caller_ns: RawFd, root: &Path, container: &Container, device: &DeviceInfo) -> Result<()> {
    mnt::ns_enter(&container.mount_ns)?;

    let mut guard = MountGuard::default();
    let result = (|| -> Result<()> {
        if !container.flags.contains(ContainerFlags::NO_DEVBIND) {
            mount_device(root, container, &device.node, &mut guard)?;
        }
        mount_procfs_gpu(root, container, &device.busid, &mut guard)?;
        if container.flags.contains(ContainerFlags::GRAPHICS_LIBS) {
            update_app_profile(container, device.node.rdev)?;
        }
        if !container.flags.contains(ContainerFlags::NO_CGROUPS) {
            if let Some(cgroup) = &container.device_cgroup {
                setup_cgroup(cgroup, device.node.rdev)?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            guard.commit();
            mnt::ns_enter_at(caller_ns)?;
            Ok(())
        }
        Err(e) => {
            guard.rollback();
            let _ = mnt::ns_enter_at(caller_ns);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_library_respects_capability_bits() {
        let utility = ContainerFlags::UTILITY_LIBS;
        assert!(matches_library("libnvidia-ml.so.535.104.05", utility));
        assert!(!matches_library("libcuda.so.535.104.05", utility));

        let graphics = ContainerFlags::GRAPHICS_LIBS;
        assert!(matches_library("libGLX_nvidia.so.0", graphics));
        assert!(matches_library("libGL.so.1", graphics));
    }

    #[test]
    fn matches_binary_requires_matching_bit() {
        assert!(matches_binary("nvidia-smi", ContainerFlags::UTILITY_BINS));
        assert!(!matches_binary("nvidia-smi", ContainerFlags::COMPUTE_BINS));
    }

    #[test]
    fn mps_binaries_are_compute_not_utility() {
        assert!(matches_binary("nvidia-cuda-mps-control", ContainerFlags::COMPUTE_BINS));
        assert!(matches_binary("nvidia-cuda-mps-server", ContainerFlags::COMPUTE_BINS));
        assert!(!matches_binary("nvidia-cuda-mps-control", ContainerFlags::UTILITY_BINS));
        assert!(!matches_binary("nvidia-cuda-mps-server", ContainerFlags::UTILITY_BINS));
    }

    #[test]
    fn filter_compat_libs_drops_same_major_version() {
        let paths = vec![PathBuf::from("/compat/libcuda.so.535.104.05"), PathBuf::from("/compat/libcuda.so.470.82.01")];
        let kept = filter_compat_libs("535.104.05", paths);
        assert_eq!(kept, vec![PathBuf::from("/compat/libcuda.so.470.82.01")]);
    }

    #[test]
    fn filter_compat_libs_drops_files_without_so_version() {
        let paths = vec![PathBuf::from("/compat/README")];
        assert!(filter_compat_libs("535.104.05", paths).is_empty());
    }

    #[test]
    fn app_profile_round_trips_through_json() {
        let text = serde_json::to_string(&AppProfile {
            profiles: vec![AppProfileEntry {
                name: "_container_".to_string(),
                settings: vec![Value::String("EGLVisibleDGPUDevices".to_string()), Value::from(3u64)],
            }],
            rules: vec![AppProfileRule {
                pattern: vec![],
                profile: "_container_".to_string(),
            }],
        })
        .unwrap();
        let parsed: AppProfile = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.profiles[0].settings[1], Value::from(3u64));
    }
}
