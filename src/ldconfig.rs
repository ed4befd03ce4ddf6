//! Sandboxed `ldconfig` execution (C9): forks a child that pivots into
//! the container's rootfs, drops every privilege it can, and `execve`s
//! the container's own `ldconfig` to refresh `ld.so.cache` after new
//! libraries have been bind-mounted in.
//!
//! Grounded on `original_source/src/nvc_exec.c`'s `nvc_ldcache_update`:
//! `change_rootfs` (`unshare`+`pivot_root`), `limit_resources` (rlimits),
//! `drop_capabilities`/`drop_privileges`, `limit_syscalls` (seccomp), then
//! `execle` with an empty environment.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::Path;

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::caps;
use crate::consts::Operation;
use crate::container::{Container, LdconfigTarget};
use crate::error::{IoContext, NvcError, Result};
use crate::fs::mount as mnt;

const RLIMIT_CPU_SECS: u64 = 10;
const RLIMIT_AS_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const RLIMIT_NOFILE: u64 = 64;
const RLIMIT_FSIZE_BYTES: u64 = 1024 * 1024;

/// Stack reserved for the cloned child below (`clone(2)` needs its own,
/// separate from the parent's).
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Regenerates `ld.so.cache` inside `container`'s rootfs by spawning a
/// sandboxed child in fresh PID and IPC namespaces (matching
/// `create_process(CLONE_NEWPID|CLONE_NEWIPC)`) that runs the
/// container's own `ldconfig` (or the host's, if `container.ldconfig`
/// is prefixed with `@`). Blocks until the child exits, mirroring
/// `nvc_ldcache_update`'s synchronous `create_process`/`waitpid` pair.
pub fn ldcache_update(container: &Container) -> Result<()> {
    let child = spawn_sandboxed(container)?;
    reap(child)
}

/// `clone(2)` with `CLONE_NEWPID|CLONE_NEWIPC`: the grandchild that
/// exec's `ldconfig` becomes pid 1 of a fresh PID namespace, matching
/// the original's reason for needing a real `/proc` remount before
/// `fexecve`.
fn spawn_sandboxed(container: &Container) -> Result<Pid> {
    let container = container.clone();
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let cb = Box::new(move || -> isize {
        let rv = run_child(&container);
        if let Err(e) = &rv {
            log::error!("could not start ldconfig: {}", e.message);
        }
        std::process::exit(if rv.is_ok() { 0 } else { 1 });
    });
    let flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
    unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| NvcError::protocol("process creation failed", e))
}

fn reap(child: Pid) -> Result<()> {
    match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(WaitStatus::Exited(_, code)) => Err(NvcError::protocol("process execution failed", format!("ldconfig failed with error code {code}"))),
        Ok(WaitStatus::Signaled(_, sig, _)) => Err(NvcError::protocol("process execution failed", format!("process terminated with signal {sig}"))),
        Ok(_) => Ok(()),
        Err(e) => Err(NvcError::protocol("process reaping failed", e)),
    }
}

fn run_child(container: &Container) -> Result<()> {
    unsafe { libc::prctl(libc::PR_SET_NAME, c"nvc:[ldconfig]".as_ptr() as libc::c_ulong, 0, 0, 0) };

    // The host `ldconfig` binary must be opened before the rootfs switch:
    // its path is only resolvable against the host filesystem, and once
    // we pivot_root/chroot into the container it would no longer exist.
    let host_fd = match &container.ldconfig {
        LdconfigTarget::Host(path) => Some(File::open(path).io_context(format!("open error: {}", path.display()))?),
        LdconfigTarget::Container(_) => None,
    };

    let unprivileged_target = container.uid.as_raw() != 0;

    mnt::ns_enter(&container.mount_ns)?;
    caps::restrict_to(Operation::Ldcache)?;
    if unprivileged_target {
        caps::raise_ambient(caps::Cap::CAP_DAC_OVERRIDE)?;
        caps::set_no_setuid_fixup()?;
    }
    change_rootfs(&container.rootfs, host_fd.is_some())?;
    limit_resources()?;
    caps::drop_privileges(container.uid, container.gid, true)?;
    crate::seccomp::apply()?;

    exec_ldconfig(&container.ldconfig, host_fd.as_ref(), &container.libs_dir, &container.libs32_dir)
}

/// `unshare(CLONE_NEWNS)`, make `/` private, bind-mount `rootfs` onto
/// itself, `pivot_root` into it, detach the old root, then mount fresh
/// `tmpfs` over `/proc`, `/sys`, and `/dev` so the sandboxed `ldconfig`
/// sees none of the host's contents there.
fn change_rootfs(rootfs: &Path, need_real_proc: bool) -> Result<()> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNS).io_context("namespace setup failed")?;
    mnt::mount(None, Path::new("/"), None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)?;
    mnt::mount(Some(rootfs), rootfs, None, MsFlags::MS_BIND | MsFlags::MS_REC, None)?;

    let oldroot = std::fs::File::open("/").io_context("change root failed")?;
    let newroot = std::fs::File::open(rootfs).io_context("change root failed")?;

    std::env::set_current_dir(rootfs).io_context("change root failed")?;
    pivot_root_dot().io_context("change root failed")?;

    nix::unistd::fchdir(oldroot.as_fd()).io_context("change root failed")?;
    mnt::umount_detach(Path::new("."))?;

    nix::unistd::fchdir(newroot.as_fd()).io_context("change root failed")?;
    nix::unistd::chroot(".").io_context("change root failed")?;
    std::env::set_current_dir("/").io_context("change root failed")?;

    // A real `/proc` is required when the host `ldconfig` is about to be
    // `fexecve`d: the fd was opened before the pivot and glibc's fexecve
    // resolves it through `/proc/self/fd/<n>`, which a fake tmpfs can't
    // provide.
    if need_real_proc {
        let path = Path::new("/proc");
        if path.exists() {
            mnt::mount(Some(Path::new("proc")), path, Some("proc"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC, None)?;
        }
    }
    for target in ["/proc", "/sys", "/dev"] {
        if need_real_proc && target == "/proc" {
            continue;
        }
        let path = Path::new(target);
        if path.exists() {
            mnt::mount(None, path, Some("tmpfs"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY, None)?;
        }
    }
    Ok(())
}

fn pivot_root_dot() -> Result<()> {
    let dot = CString::new(".").unwrap();
    let rv = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
    if rv != 0 {
        return Err(std::io::Error::last_os_error()).io_context("change root failed");
    }
    Ok(())
}

fn limit_resources() -> Result<()> {
    setrlimit(Resource::RLIMIT_CPU, RLIMIT_CPU_SECS, RLIMIT_CPU_SECS).io_context("resource limit failed")?;
    setrlimit(Resource::RLIMIT_AS, RLIMIT_AS_BYTES, RLIMIT_AS_BYTES).io_context("resource limit failed")?;
    setrlimit(Resource::RLIMIT_NOFILE, RLIMIT_NOFILE, RLIMIT_NOFILE).io_context("resource limit failed")?;
    setrlimit(Resource::RLIMIT_FSIZE, RLIMIT_FSIZE_BYTES, RLIMIT_FSIZE_BYTES).io_context("resource limit failed")
}

/// Runs `ldconfig` with an empty environment and `libs_dir`/`libs32_dir`
/// as its only arguments, matching `execle(ldconfig, ldconfig, libs_dir,
/// libs32_dir, NULL, (char *[]){NULL})`. A bare `ENOENT` (no `ldconfig`
/// binary inside the rootfs) is not an error: the original treats a
/// missing binary as "nothing to refresh". When `host_fd` is set (the
/// caller passed `@/path/to/ldconfig`) the pre-opened host binary is
/// `fexecve`d instead of resolving `ldconfig`'s path inside the rootfs.
fn exec_ldconfig(ldconfig: &LdconfigTarget, host_fd: Option<&File>, libs_dir: &Path, libs32_dir: &Path) -> Result<()> {
    let path = to_cstring(ldconfig.path())?;
    let arg0 = path.clone();
    let arg1 = to_cstring(libs_dir)?;
    let arg2 = to_cstring(libs32_dir)?;
    let args = [arg0, arg1, arg2];
    let env: [CString; 0] = [];

    log::info!("executing {}", ldconfig.path().display());
    let result = match host_fd {
        Some(f) => nix::unistd::fexecve(f.as_raw_fd(), &args, &env),
        None => nix::unistd::execve(&path, &args, &env),
    };
    match result {
        Ok(_) => unreachable!("exec does not return on success"),
        Err(nix::Error::ENOENT) => {
            log::warn!("missing ldconfig at {}", ldconfig.path().display());
            Ok(())
        }
        Err(e) => Err(NvcError::io(format!("exec error: {}", ldconfig.path().display()), e)),
    }
}

fn to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes()).map_err(|e| NvcError::invalid("invalid path", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_cstring_rejects_interior_nul() {
        assert!(to_cstring(Path::new("/bad\0path")).is_err());
    }

    #[test]
    fn to_cstring_accepts_plain_path() {
        assert_eq!(to_cstring(Path::new("/sbin/ldconfig")).unwrap().as_c_str().to_str().unwrap(), "/sbin/ldconfig");
    }
}
