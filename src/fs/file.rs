//! File creation/removal with filesystem-uid/gid switching.
//!
//! Grounded on `original_source/src/utils.c`'s `file_create`/`file_remove`/
//! `set_fsugid`: bind-mount targets must be created with the *container's*
//! uid/gid (not the caller's), which since Linux 4.8 means switching the
//! fsuid/fsgid around the actual `open`/`mkdir`/`symlink` call so the
//! owning user namespace sees the expected owner.

use std::fs::OpenOptions;
use std::os::unix::fs::{symlink, MetadataExt, OpenOptionsExt};
use std::path::Path;

use nix::unistd::{Gid, Uid};

use crate::error::{IoContext, NvcError, Result};

/// What kind of node [`create`] should make.
#[derive(Debug, Clone, Copy)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
}

/// Creates `path` (and its ancestor directories) owned by `uid`/`gid`,
/// writing `data` as file contents or symlink target as appropriate.
pub fn create(path: &Path, kind: NodeKind, data: Option<&str>, uid: Uid, gid: Gid, mode: u32) -> Result<()> {
    let _guard = FsIdGuard::switch(uid, gid)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).io_context(format!("file creation failed: {}", path.display()))?;
    }

    match kind {
        NodeKind::Directory => match std::fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(NvcError::io(format!("file creation failed: {}", path.display()), e)),
        },
        NodeKind::Symlink => {
            let target = data.ok_or_else(|| NvcError::invalid("file creation failed", "missing symlink target"))?;
            match symlink(target, path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(NvcError::io(format!("file creation failed: {}", path.display()), e)),
            }
        }
        NodeKind::Regular => {
            use std::io::Write;
            let mut opts = OpenOptions::new();
            opts.create(true).mode(mode & 0o777);
            if data.is_some() {
                opts.write(true).truncate(true);
            } else {
                opts.write(true);
            }
            let mut f = opts
                .open(path)
                .io_context(format!("file creation failed: {}", path.display()))?;
            if let Some(contents) = data {
                f.write_all(contents.as_bytes())
                    .io_context(format!("file creation failed: {}", path.display()))?;
            }
        }
    }
    Ok(())
}

/// Removes `path` with a post-order walk restricted to a single
/// filesystem, mirroring `do_file_remove`'s `nftw(FTW_MOUNT|FTW_PHYS|FTW_DEPTH)`:
/// a directory is only ever `rmdir`'d (never recursed into once it
/// crosses onto another mount, and `ENOTEMPTY` is not an error), a
/// regular file is unlinked only when empty, and a symlink is unlinked
/// only when dangling or its target is empty. Non-empty content under a
/// bind-mounted subtree is therefore left untouched rather than deleted.
pub fn remove(path: &Path) -> Result<()> {
    let top_dev = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.dev(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(NvcError::io(format!("file removal failed: {}", path.display()), e)),
    };
    remove_inner(path, top_dev).io_context(format!("file removal failed: {}", path.display()))
}

fn remove_inner(path: &Path, top_dev: u64) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        if meta.dev() == top_dev {
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries {
                    remove_inner(&entry?.path(), top_dev)?;
                }
            }
        }
        match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
            Err(e) => Err(e),
        }
    } else if meta.file_type().is_symlink() {
        match std::fs::metadata(path) {
            Ok(target) if target.size() == 0 => unlink_if_present(path),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => unlink_if_present(path),
            Err(e) => Err(e),
        }
    } else if meta.size() == 0 {
        unlink_if_present(path)
    } else {
        Ok(())
    }
}

fn unlink_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// RAII guard that switches the calling thread's fsuid/fsgid for the
/// duration it is held, restoring the previous values on drop.
struct FsIdGuard {
    prev_uid: Uid,
    prev_gid: Gid,
}

impl FsIdGuard {
    fn switch(uid: Uid, gid: Gid) -> Result<Self> {
        let prev_gid = Gid::from_raw(unsafe { libc::setfsgid(gid.as_raw()) } as libc::gid_t);
        let prev_uid = Uid::from_raw(unsafe { libc::setfsuid(uid.as_raw()) } as libc::uid_t);
        Ok(FsIdGuard { prev_uid, prev_gid })
    }
}

impl Drop for FsIdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::setfsuid(self.prev_uid.as_raw());
            libc::setfsgid(self.prev_gid.as_raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_regular_file_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.txt");
        create(&path, NodeKind::Regular, Some("hello"), Uid::current(), Gid::current(), 0o644).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn creates_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link");
        create(&path, NodeKind::Symlink, Some("/dev/null"), Uid::current(), Gid::current(), 0o777).unwrap();
        assert_eq!(std::fs::read_link(&path).unwrap(), Path::new("/dev/null"));
    }

    #[test]
    fn remove_is_idempotent_on_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(remove(&path).is_ok());
    }

    #[test]
    fn remove_unlinks_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_leaves_non_empty_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"not empty").unwrap();
        remove(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn remove_unlinks_dangling_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dangling");
        symlink(dir.path().join("nowhere"), &path).unwrap();
        remove(&path).unwrap();
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[test]
    fn remove_leaves_symlink_to_non_empty_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"not empty").unwrap();
        let path = dir.path().join("link");
        symlink(&target, &path).unwrap();
        remove(&path).unwrap();
        assert!(std::fs::symlink_metadata(&path).is_ok());
    }

    #[test]
    fn remove_rmdirs_empty_directory_but_leaves_non_empty_one() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty_dir");
        std::fs::create_dir(&empty).unwrap();
        remove(&empty).unwrap();
        assert!(!empty.exists());

        let full = dir.path().join("full_dir");
        std::fs::create_dir(&full).unwrap();
        std::fs::write(full.join("data"), b"not empty").unwrap();
        remove(&full).unwrap();
        assert!(full.exists());
        assert!(full.join("data").exists());
    }
}
