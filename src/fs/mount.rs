//! Bind-mount and mount-namespace wrappers (C1).
//!
//! Grounded on `original_source/src/utils.c`'s `xmount`/`ns_enter`: a
//! uniform error path over `nix::mount::mount`/`umount2`, and `setns`
//! against an already-open or freshly opened `/proc/<pid>/ns/mnt` fd.

use std::os::unix::io::{AsFd, BorrowedFd, RawFd};
use std::path::Path;

use nix::mount::{self, MntFlags, MsFlags};
use nix::sched::CloneFlags;

use crate::error::{IoContext, Result};

/// `mount(2)` with a uniform error path, matching `xmount`.
pub fn mount(source: Option<&Path>, target: &Path, fstype: Option<&str>, flags: MsFlags, data: Option<&str>) -> Result<()> {
    mount::mount(source, target, fstype, flags, data).io_context(format!("mount error: {}", target.display()))
}

/// `umount2(2)` detaching lazily, matching `unmount`'s `MNT_DETACH` use.
pub fn umount_detach(target: &Path) -> Result<()> {
    mount::umount2(target, MntFlags::MNT_DETACH).io_context(format!("umount error: {}", target.display()))
}

/// Enters the mount namespace referenced by the open fd `ns`, matching
/// `ns_enter_at`.
pub fn ns_enter_at(ns: RawFd) -> Result<()> {
    let fd: BorrowedFd = unsafe { BorrowedFd::borrow_raw(ns) };
    nix::sched::setns(fd, CloneFlags::CLONE_NEWNS).io_context("namespace association failed")
}

/// Opens `path` (a `/proc/<pid>/ns/mnt` symlink) and enters it, matching
/// `ns_enter`.
pub fn ns_enter(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).io_context(format!("namespace association failed: {}", path.display()))?;
    nix::sched::setns(file.as_fd(), CloneFlags::CLONE_NEWNS).io_context(format!("namespace association failed: {}", path.display()))
}
