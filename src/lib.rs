//! `nvc-core`: host-side runtime helper that prepares a container's
//! rootfs for NVIDIA GPU access.
//!
//! Grounded on `original_source/src/nvc.c`: a single [`Context`] owns the
//! driver RPC channel and the process's original mount namespace, and is
//! the entry point for every other component. Library code never
//! initializes a logger — only `log::{debug,info,warn,error}` calls, left
//! to the binary (`main.rs`) to wire up.

pub mod caps;
pub mod consts;
pub mod container;
pub mod device;
pub mod driver;
pub mod dsl;
pub mod elf;
pub mod error;
pub mod fs;
pub mod info;
pub mod ldcache;
pub mod ldconfig;
pub mod mount;
pub mod options;
pub mod seccomp;
pub mod version;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use nix::unistd::{Gid, Uid};

pub use container::{Container, ContainerConfig, LdconfigTarget};
pub use device::DeviceInfo;
pub use driver::Driver;
pub use error::{ErrorCode, NvcError, Result};
pub use info::DriverInfo;
pub use options::{ContainerFlags, DriverOpts, LibraryFlags};

const PROC_OVERFLOWUID: &str = "/proc/sys/kernel/overflowuid";
const PROC_OVERFLOWGID: &str = "/proc/sys/kernel/overflowgid";
const DEFAULT_LDCACHE: &str = "/etc/ld.so.cache";

/// Caller-supplied library context configuration, mirroring
/// `nvc_config_new`/`copy_config`'s defaults: `root` defaults to `/`,
/// `ldcache` to `/etc/ld.so.cache`, and `uid`/`gid` to the kernel's
/// overflow identity (the same sentinel the original maps `(uid_t)-1` to).
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub ldcache: PathBuf,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("/"),
            ldcache: PathBuf::from(DEFAULT_LDCACHE),
            uid: None,
            gid: None,
        }
    }
}

fn read_overflow_id(path: &str) -> u32 {
    std::fs::read_to_string(path).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(65534)
}

/// The library context: owns the driver RPC channel and the process's
/// original mount namespace fd, and gates every operation behind
/// [`Context::init`]. Mirrors `nvc_context`'s lifecycle invariants:
/// idempotent init/shutdown, un-initialized on failure.
///
/// Not `Sync`: every operation issues a blocking RPC call or namespace
/// switch against shared process state (the driver child's socket, the
/// caller's current mount namespace), so concurrent use from multiple
/// threads is never supported.
pub struct Context {
    config: Config,
    initialized: bool,
    last_error: Option<NvcError>,
    mnt_ns: Option<File>,
    driver: Option<Driver>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Context {
            config,
            initialized: false,
            last_error: None,
            mnt_ns: None,
            driver: None,
        }
    }

    /// Returns `true` once [`Context::init`] has succeeded and
    /// [`Context::shutdown`] has not yet run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Forks the driver RPC child and records the caller's current mount
    /// namespace for later `setns` round-trips. A no-op success if
    /// already initialized; on any failure the
    /// context is left un-initialized so the caller may retry, matching
    /// `nvc_init`'s `fail:` unwind path.
    pub fn init(&mut self, lib_opts: LibraryFlags, drv_opts: &str) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if lib_opts.contains(LibraryFlags::LOAD_KMODS) {
            log::warn!("kernel module loading was requested but is not supported by this build");
        }

        let result = self.init_inner(drv_opts);
        if result.is_err() {
            self.mnt_ns = None;
            self.driver = None;
        } else {
            self.initialized = true;
        }
        self.record(result)
    }

    fn init_inner(&mut self, drv_opts: &str) -> Result<()> {
        let _ = options::DriverOpts::parse(drv_opts)?;

        let mnt_ns = File::open("/proc/self/ns/mnt").map_err(|e| NvcError::io("namespace capture failed", e))?;
        set_cloexec(&mnt_ns)?;

        let uid = self.config.uid.unwrap_or_else(|| Uid::from_raw(read_overflow_id(PROC_OVERFLOWUID)));
        let gid = self.config.gid.unwrap_or_else(|| Gid::from_raw(read_overflow_id(PROC_OVERFLOWGID)));
        log::info!("initializing library context (version={})", version::pkg_version());

        let driver = Driver::init(&self.config.root, uid, gid, true)?;

        self.mnt_ns = Some(mnt_ns);
        self.driver = Some(driver);
        Ok(())
    }

    /// Tears down the driver RPC child. A no-op success if not
    /// initialized, matching `nvc_shutdown`.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        let result = match self.driver.take() {
            Some(driver) => driver.shutdown(),
            None => Ok(()),
        };
        self.mnt_ns = None;
        self.initialized = false;
        self.record(result)
    }

    fn driver_mut(&mut self) -> Result<&mut Driver> {
        self.driver.as_mut().ok_or_else(|| NvcError::invalid("library context error", "not initialized"))
    }

    /// Queries the driver for its full binary/library/device/ipc
    /// inventory, resolved against `self.config.root`.
    pub fn driver_info(&mut self, opts: &DriverOpts) -> Result<DriverInfo> {
        let root = self.config.root.clone();
        let ldcache = self.config.ldcache.clone();
        let driver = self.driver_mut()?;
        let result = info::driver_info_new(driver, &root, &ldcache, opts);
        self.record(result)
    }

    /// Queries the driver for the per-GPU device list.
    pub fn device_info(&mut self) -> Result<Vec<DeviceInfo>> {
        let driver = self.driver_mut()?;
        let result = device::device_info_new(driver);
        self.record(result)
    }

    /// Injects the driver's binaries/libraries/devices/ipcs into
    /// `container`, entering and leaving `container.mount_ns` around the
    /// mount plan.
    pub fn driver_mount(&mut self, container: &Container, info: &DriverInfo) -> Result<()> {
        let caller_ns = self.mnt_ns.as_ref().ok_or_else(|| NvcError::invalid("library context error", "not initialized"))?;
        let root = self.config.root.clone();
        let result = mount::driver_mount(caller_ns.as_raw_fd(), &root, container, info);
        self.record(result)
    }

    /// Injects a single GPU device node (and authorizes its cgroup
    /// device entry) into `container`.
    pub fn device_mount(&mut self, container: &Container, device: &DeviceInfo) -> Result<()> {
        let caller_ns = self.mnt_ns.as_ref().ok_or_else(|| NvcError::invalid("library context error", "not initialized"))?;
        let root = self.config.root.clone();
        let result = mount::device_mount(caller_ns.as_raw_fd(), &root, container, device);
        self.record(result)
    }

    /// Refreshes `ld.so.cache` inside `container`'s rootfs via the
    /// sandboxed `ldconfig` runner (C9).
    pub fn ldcache_update(&mut self, container: &Container) -> Result<()> {
        let result = ldconfig::ldcache_update(container);
        self.record(result)
    }

    /// The last error recorded by any fallible call on this context,
    /// mirroring `nvc_error`.
    pub fn error(&self) -> Option<&NvcError> {
        self.last_error.as_ref()
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.clone()),
        }
        result
    }
}

fn set_cloexec(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(NvcError::io("namespace capture failed", std::io::Error::last_os_error()));
    }
    let rv = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rv < 0 {
        return Err(NvcError::io("namespace capture failed", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_root_and_system_ldcache() {
        let cfg = Config::default();
        assert_eq!(cfg.root, PathBuf::from("/"));
        assert_eq!(cfg.ldcache, PathBuf::from(DEFAULT_LDCACHE));
    }

    #[test]
    fn uninitialized_context_rejects_driver_info() {
        let mut ctx = Context::new(Config::default());
        assert!(ctx.driver_info(&DriverOpts::default()).is_err());
        assert!(ctx.error().is_some());
    }

    #[test]
    fn shutdown_without_init_is_a_no_op() {
        let mut ctx = Context::new(Config::default());
        assert!(ctx.shutdown().is_ok());
    }
}
