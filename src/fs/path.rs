//! Chroot-safe path resolution.
//!
//! Grounded on `original_source/src/utils.c`'s `do_path_resolve`: walks a
//! path component by component below a root directory fd, following
//! symlinks manually so the walk can never escape `root` even through
//! `..` or an absolute symlink target, using an explicit step enum in
//! place of the original's `goto`-driven state machine; [`Step`] is
//! that enum.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::error::{NvcError, Result};

const MAX_SYMLINKS: u32 = 40;

/// Outcome of resolving a single path component.
#[derive(Debug)]
enum Step {
    /// Component exists and is a directory (or the final, possibly
    /// non-directory, component); `fd` now refers to it.
    Entered(OwnedFd),
    /// Component is a symlink; its target has been spliced into the
    /// remaining path to walk.
    Symlink,
    /// Component (and everything below it) does not exist yet.
    NonExistent,
}

/// A directory (or `O_PATH`) file descriptor that closes on drop.
#[derive(Debug)]
struct OwnedFd(RawFd);

impl OwnedFd {
    fn open_at(dir: RawFd, path: &Path, directory: bool) -> nix::Result<Self> {
        let mut flags = OFlag::O_PATH | OFlag::O_NOFOLLOW;
        if directory {
            flags |= OFlag::O_DIRECTORY;
        }
        let fd = fcntl::open(path, flags, Mode::empty())?;
        Ok(OwnedFd(fd))
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

/// Resolves `path` below `root`, returning the canonical path relative
/// to `root` (i.e. starting with `/`, as it would appear inside the
/// chroot). Non-existent trailing components are preserved verbatim.
pub fn path_resolve(root: &Path, path: &Path) -> Result<PathBuf> {
    do_path_resolve(root, path, false)
}

/// Like [`path_resolve`], but returns the path joined back onto `root`
/// (i.e. the real, host-visible location).
pub fn path_resolve_full(root: &Path, path: &Path) -> Result<PathBuf> {
    do_path_resolve(root, path, true)
}

fn do_path_resolve(root: &Path, path: &Path, full: bool) -> Result<PathBuf> {
    assert!(root.is_absolute(), "path_resolve root must be absolute");

    let mut fd = OwnedFd::open_at(libc::AT_FDCWD, root, true)
        .map_err(|e| NvcError::io(format!("open failed: {}", root.display()), e))?;

    let mut remaining: Vec<OsString> = path
        .as_os_str()
        .as_bytes()
        .split(|&b| b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
        .map(|c| OsStr::from_bytes(c).to_os_string())
        .collect();
    remaining.reverse();

    let mut resolved = PathBuf::from("/");
    let mut noents: u32 = 0;
    let mut nlinks: u32 = 0;

    while let Some(component) = remaining.pop() {
        if component == ".." {
            if noents > 0 {
                noents -= 1;
            } else if resolved != Path::new("/") {
                let parent_fd = OwnedFd::open_at(fd.as_raw_fd(), Path::new(".."), true)
                    .map_err(|e| NvcError::io(format!("open failed: {}", path.display()), e))?;
                fd = parent_fd;
            } else {
                return Err(NvcError::invalid(
                    "path error",
                    format!("{} resolves outside of {}", path.display(), root.display()),
                ));
            }
            if resolved != Path::new("/") {
                resolved.pop();
                if resolved.as_os_str().is_empty() {
                    resolved = PathBuf::from("/");
                }
            }
            continue;
        }

        if noents > 0 {
            noents += 1;
            resolved.push(&component);
            continue;
        }

        match probe(&fd, &component) {
            Step::Entered(next) => {
                fd = next;
                resolved.push(&component);
            }
            Step::Symlink => {
                nlinks += 1;
                if nlinks > MAX_SYMLINKS {
                    return Err(NvcError::invalid("path error", "too many levels of symbolic links"));
                }
                let target = std::fs::read_link(procfs_self(&fd))
                    .map_err(|e| NvcError::io(format!("path error: {}", path.display()), e))?;
                if target.is_absolute() {
                    resolved = PathBuf::from("/");
                    fd = OwnedFd::open_at(libc::AT_FDCWD, root, true)
                        .map_err(|e| NvcError::io(format!("open failed: {}", root.display()), e))?;
                    for c in target.components().skip(1) {
                        remaining.push(c.as_os_str().to_os_string());
                    }
                } else {
                    for c in target.components().rev() {
                        remaining.push(c.as_os_str().to_os_string());
                    }
                }
            }
            Step::NonExistent => {
                noents = 1;
                resolved.push(&component);
            }
        }
    }

    if full {
        Ok(join_under(root, &resolved))
    } else {
        Ok(resolved)
    }
}

fn probe(dir: &OwnedFd, component: &OsStr) -> Step {
    let path = Path::new(component);
    match unistd::readlinkat(dir.as_raw_fd(), path) {
        Ok(_) => Step::Symlink,
        Err(nix::Error::EINVAL) => {
            match OwnedFd::open_at(dir.as_raw_fd(), path, false) {
                Ok(fd) => Step::Entered(fd),
                Err(_) => Step::NonExistent,
            }
        }
        Err(_) => Step::NonExistent,
    }
}

fn procfs_self(fd: &OwnedFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

fn join_under(root: &Path, relative: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for c in relative.components() {
        if c.as_os_str() != OsStr::new("/") {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn resolves_plain_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let resolved = path_resolve(dir.path(), Path::new("a/b")).unwrap();
        assert_eq!(resolved, Path::new("/a/b"));
    }

    #[test]
    fn follows_relative_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("real")).unwrap();
        symlink("real", dir.path().join("link")).unwrap();
        let resolved = path_resolve(dir.path(), Path::new("link")).unwrap();
        assert_eq!(resolved, Path::new("/real"));
    }

    #[test]
    fn rejects_escape_above_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = path_resolve(dir.path(), Path::new("../../etc/passwd"));
        assert!(err.is_err());
    }

    #[test]
    fn preserves_nonexistent_tail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        let resolved = path_resolve(dir.path(), Path::new("a/missing/deep")).unwrap();
        assert_eq!(resolved, Path::new("/a/missing/deep"));
    }
}
