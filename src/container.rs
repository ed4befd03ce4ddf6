//! Container identity and cgroup/namespace lookup (C7).
//!
//! Grounded on `original_source/src/nvc_container.c`: resolves a target
//! container (by pid, in supervised mode, or by a standalone rootfs) to
//! its owning uid/gid, mount namespace path, devices-cgroup path, and
//! distro-specific library layout.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Pid, Uid};

use crate::error::{NvcError, Result};
use crate::fs::path::path_resolve_full;
use crate::options::ContainerFlags;

const USR_BIN_DIR: &str = "/usr/bin";
const USR_LIB_DIR: &str = "/usr/lib";
const USR_LIB32_DIR: &str = "/usr/lib32";
const USR_LIB32_ALT_DIR: &str = "/lib32";
const USR_LIB_MULTIARCH_DIR: &str = "/usr/lib/x86_64-linux-gnu";
const USR_LIB32_MULTIARCH_DIR: &str = "/usr/lib/i386-linux-gnu";
const LDCONFIG_PATH: &str = "/sbin/ldconfig";
const LDCONFIG_ALT_PATH: &str = "/sbin/ldconfig.real";

/// Caller-supplied container description, mirroring
/// `nvc_container_config_new`'s minimal `{pid, rootfs}` plus the
/// directory overrides `nvc_container_new` otherwise infers.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub pid: i32,
    pub rootfs: PathBuf,
    pub bins_dir: Option<PathBuf>,
    pub libs_dir: Option<PathBuf>,
    pub libs32_dir: Option<PathBuf>,
    pub cudart_dir: Option<PathBuf>,
    pub ldconfig: Option<PathBuf>,
}

impl ContainerConfig {
    pub fn new(pid: i32, rootfs: impl Into<PathBuf>) -> Self {
        ContainerConfig {
            pid,
            rootfs: rootfs.into(),
            ..Default::default()
        }
    }
}

/// Where the sandboxed `ldconfig` runner (C9) should find its binary:
/// inside the container's own rootfs (the default, secure mode), or on
/// the host filesystem when the caller's `--ldconfig` option is
/// `@`-prefixed. The host case is opened and
/// `fexecve`d before the namespace/rootfs switch so the path remains
/// resolvable after `pivot_root`.
#[derive(Debug, Clone)]
pub enum LdconfigTarget {
    Container(PathBuf),
    Host(PathBuf),
}

impl LdconfigTarget {
    pub fn path(&self) -> &Path {
        match self {
            LdconfigTarget::Container(p) | LdconfigTarget::Host(p) => p,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, LdconfigTarget::Host(_))
    }
}

/// A resolved container: identity, namespace, and directory layout
/// ready for the mount plan (C8).
#[derive(Debug, Clone)]
pub struct Container {
    pub flags: ContainerFlags,
    pub pid: i32,
    pub rootfs: PathBuf,
    pub uid: Uid,
    pub gid: Gid,
    pub bins_dir: PathBuf,
    pub libs_dir: PathBuf,
    pub libs32_dir: PathBuf,
    pub cudart_dir: PathBuf,
    pub ldconfig: LdconfigTarget,
    pub compat_libs: Vec<PathBuf>,
    pub mount_ns: PathBuf,
    pub device_cgroup: Option<PathBuf>,
}

impl Container {
    pub fn new(cfg: &ContainerConfig, opts: &str) -> Result<Self> {
        if cfg.pid <= 0 || cfg.rootfs.as_os_str().is_empty() || !cfg.rootfs.is_absolute() {
            return Err(NvcError::invalid("invalid argument", "pid/rootfs"));
        }

        let flags = ContainerFlags::parse(opts)?;
        let supervised = flags.contains(ContainerFlags::SUPERVISED);
        let standalone = flags.contains(ContainerFlags::STANDALONE);
        if supervised == standalone {
            return Err(NvcError::invalid("invalid mode of operation", "supervised xor standalone"));
        }

        log::info!("configuring container with '{opts}'");

        let resolved_rootfs = resolve_rootfs(&cfg.rootfs, standalone, cfg.pid)?;
        let (bins_dir, libs_dir, libs32_dir, cudart_dir, ldconfig) = resolve_layout(cfg, &resolved_rootfs)?;
        let (uid, gid) = lookup_owner(&resolved_rootfs, standalone, cfg.pid)?;

        let compat_libs = if flags.contains(ContainerFlags::COMPUTE_LIBS) && !flags.contains(ContainerFlags::NO_CNTLIBS) {
            find_compat_libs(&resolved_rootfs, &cudart_dir)?
        } else {
            Vec::new()
        };

        let prefix = if standalone { resolved_rootfs.clone() } else { PathBuf::from("/") };
        let mount_ns = find_namespace_path(&prefix, cfg.pid, "mnt");
        let device_cgroup = if flags.contains(ContainerFlags::NO_CGROUPS) {
            None
        } else {
            Some(find_cgroup_path(&prefix, cfg.pid, "devices")?)
        };

        log::info!("setting pid to {}", cfg.pid);
        log::info!("setting rootfs to {}", resolved_rootfs.display());
        log::info!("setting owner to {}:{}", uid.as_raw(), gid.as_raw());
        log::info!("setting ldconfig to {}", ldconfig.path().display());

        Ok(Container {
            flags,
            pid: cfg.pid,
            rootfs: resolved_rootfs,
            uid,
            gid,
            bins_dir,
            libs_dir,
            libs32_dir,
            cudart_dir,
            ldconfig,
            compat_libs,
            mount_ns,
            device_cgroup,
        })
    }
}

fn resolve_rootfs(rootfs: &Path, standalone: bool, pid: i32) -> Result<PathBuf> {
    if standalone {
        Ok(rootfs.to_path_buf())
    } else {
        let proc_root = PathBuf::from(format!("/proc/{pid}/root"));
        path_resolve_full(&proc_root, rootfs)
    }
}

fn resolve_layout(cfg: &ContainerConfig, rootfs: &Path) -> Result<(PathBuf, PathBuf, PathBuf, PathBuf, LdconfigTarget)> {
    let bins_dir = cfg.bins_dir.clone().unwrap_or_else(|| PathBuf::from(USR_BIN_DIR));

    let (libs_dir, libs32_dir) = if cfg.libs_dir.is_some() && cfg.libs32_dir.is_some() {
        (cfg.libs_dir.clone().unwrap(), cfg.libs32_dir.clone().unwrap())
    } else {
        let multiarch = exists_under(rootfs, "/etc/debian_version")?;
        if multiarch {
            (
                cfg.libs_dir.clone().unwrap_or_else(|| PathBuf::from(USR_LIB_MULTIARCH_DIR)),
                cfg.libs32_dir.clone().unwrap_or_else(|| PathBuf::from(USR_LIB32_MULTIARCH_DIR)),
            )
        } else {
            let libs_dir = cfg.libs_dir.clone().unwrap_or_else(|| PathBuf::from(USR_LIB_DIR));
            let libs32_dir = match &cfg.libs32_dir {
                Some(d) => d.clone(),
                None => {
                    if exists_under(rootfs, USR_LIB32_DIR)? {
                        PathBuf::from(USR_LIB32_DIR)
                    } else if exists_under(rootfs, USR_LIB32_ALT_DIR)? {
                        PathBuf::from(USR_LIB32_ALT_DIR)
                    } else {
                        PathBuf::from(USR_LIB32_DIR)
                    }
                }
            };
            (libs_dir, libs32_dir)
        }
    };

    let cudart_dir = cfg.cudart_dir.clone().unwrap_or_else(|| PathBuf::from(crate::consts::CUDA_RUNTIME_DIR));

    let ldconfig = match &cfg.ldconfig {
        Some(l) => match l.as_os_str().as_encoded_bytes().strip_prefix(b"@") {
            Some(rest) => {
                use std::os::unix::ffi::OsStrExt;
                LdconfigTarget::Host(PathBuf::from(std::ffi::OsStr::from_bytes(rest)))
            }
            None => LdconfigTarget::Container(l.clone()),
        },
        None => {
            if exists_under(rootfs, LDCONFIG_ALT_PATH)? {
                LdconfigTarget::Container(PathBuf::from(LDCONFIG_ALT_PATH))
            } else {
                LdconfigTarget::Container(PathBuf::from(LDCONFIG_PATH))
            }
        }
    };

    Ok((bins_dir, libs_dir, libs32_dir, cudart_dir, ldconfig))
}

fn exists_under(rootfs: &Path, path: &str) -> Result<bool> {
    let full = path_resolve_full(rootfs, Path::new(path))?;
    Ok(full.exists())
}

fn lookup_owner(rootfs: &Path, standalone: bool, pid: i32) -> Result<(Uid, Gid)> {
    let proc_path = if standalone {
        rootfs.join(format!("proc/{pid}"))
    } else {
        PathBuf::from(format!("/proc/{pid}"))
    };
    let meta = std::fs::metadata(&proc_path).map_err(|e| NvcError::io(format!("owner lookup failed: {}", proc_path.display()), e))?;
    use std::os::unix::fs::MetadataExt;
    Ok((Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid())))
}

fn find_namespace_path(prefix: &Path, pid: i32, namespace: &str) -> PathBuf {
    prefix.join(format!("proc/{pid}/ns/{namespace}"))
}

/// Parses `/proc/<pid>/mountinfo` for the cgroup v1 mount point of
/// `subsys`, then `/proc/<pid>/cgroup` for this process's root within
/// it, mirroring `cgroup_mount`/`cgroup_root`.
fn find_cgroup_path(prefix: &Path, pid: i32, subsys: &str) -> Result<PathBuf> {
    let mountinfo_path = prefix.join(format!("proc/{pid}/mountinfo"));
    let mountinfo = std::fs::read_to_string(&mountinfo_path).map_err(|e| NvcError::io(format!("read error: {}", mountinfo_path.display()), e))?;

    let mut mount_point = None;
    let mut root_prefix = String::new();
    for line in mountinfo.lines() {
        if let Some((root, mount)) = parse_mountinfo_line(line, subsys) {
            root_prefix = root;
            mount_point = Some(mount);
            break;
        }
    }
    let mount_point = mount_point.ok_or_else(|| NvcError::missing(format!("cgroup subsystem {subsys} not found"), mountinfo_path.display()))?;

    let cgroup_path = prefix.join(format!("proc/{pid}/cgroup"));
    let cgroup_text = std::fs::read_to_string(&cgroup_path).map_err(|e| NvcError::io(format!("read error: {}", cgroup_path.display()), e))?;

    let mut root = None;
    for line in cgroup_text.lines() {
        if let Some(r) = parse_cgroup_line(line, subsys, &root_prefix) {
            root = Some(r);
            break;
        }
    }
    let root = root.ok_or_else(|| NvcError::missing(format!("cgroup subsystem {subsys} not found"), cgroup_path.display()))?;

    Ok(PathBuf::from(format!("{}{}{}", prefix.display(), mount_point, root)))
}

fn parse_mountinfo_line(line: &str, subsys: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = line.split(' ').collect();
    let sep = fields.iter().position(|f| *f == "-")?;
    if sep < 5 || fields.len() < sep + 3 {
        return None;
    }
    let root = fields[3];
    let mount = fields[4];
    let fstype = fields[sep + 1];
    let super_opts = fields[sep + 3];
    if fstype != "cgroup" || !super_opts.contains(subsys) {
        return None;
    }
    if root.len() >= 4096 || root.starts_with("/..") {
        return None;
    }
    Some((root.to_string(), mount.to_string()))
}

fn parse_cgroup_line(line: &str, subsys: &str, prefix: &str) -> Option<String> {
    let mut parts = line.splitn(3, ':');
    let _id = parts.next()?;
    let controllers = parts.next()?;
    let mut path = parts.next()?.to_string();
    if !controllers.contains(subsys) {
        return None;
    }
    if path.is_empty() || path.len() >= 4096 || path.starts_with("/..") {
        return None;
    }
    if prefix != "/" && path.starts_with(prefix) {
        path = path[prefix.len()..].to_string();
    }
    Some(path)
}

/// Globs `<cudart_dir>/compat/lib*.so.*` and resolves each hit,
/// deduplicating resolved paths, matching `find_library_paths`.
fn find_compat_libs(rootfs: &Path, cudart_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = rootfs.join(cudart_dir.strip_prefix("/").unwrap_or(cudart_dir)).join("compat");
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(out);
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("lib") || !name.contains(".so.") {
            continue;
        }
        let resolved = path_resolve_full(rootfs, &cudart_dir.join("compat").join(&*name))?;
        if !out.contains(&resolved) {
            log::info!("selecting {}", resolved.display());
            out.push(resolved);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cgroup_mountinfo_line() {
        let line = "25 30 0:22 / /sys/fs/cgroup/devices rw,nosuid - cgroup cgroup rw,devices";
        let (root, mount) = parse_mountinfo_line(line, "devices").unwrap();
        assert_eq!(root, "/");
        assert_eq!(mount, "/sys/fs/cgroup/devices");
    }

    #[test]
    fn parses_cgroup_self_line_with_prefix_strip() {
        let line = "4:devices:/docker/abc123";
        let root = parse_cgroup_line(line, "devices", "/docker").unwrap();
        assert_eq!(root, "/abc123");
    }

    #[test]
    fn rejects_non_absolute_rootfs() {
        let cfg = ContainerConfig::new(123, "relative/path");
        assert!(Container::new(&cfg, "standalone no-cgroups").is_err());
    }

    #[test]
    fn find_compat_libs_resolves_under_cudart_dir() {
        let rootfs = tempfile::tempdir().unwrap();
        let cudart_dir = Path::new("/usr/local/cuda");
        let compat_dir = rootfs.path().join("usr/local/cuda/compat");
        std::fs::create_dir_all(&compat_dir).unwrap();
        std::fs::write(compat_dir.join("libcuda.so.470.82.01"), b"").unwrap();

        let found = find_compat_libs(rootfs.path(), cudart_dir).unwrap();
        assert_eq!(found, vec![rootfs.path().join("usr/local/cuda/compat/libcuda.so.470.82.01")]);
    }
}
