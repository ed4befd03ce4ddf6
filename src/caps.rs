//! Capability and privilege management (C4).
//!
//! Grounded on `original_source/src/utils.c`'s `perm_drop_privileges`,
//! `perm_set_bounds`, and `perm_set_capabilities`. Uses the `caps` crate
//! in place of hand-written `libcap` FFI, and `nix`'s `prctl` wrappers
//! (via `libc::prctl` directly where `nix` has no typed wrapper, e.g.
//! `PR_CAPBSET_DROP`/`PR_CAP_AMBIENT`).

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{self, Gid, Uid};

use crate::consts::{ecaps_for, Operation, BOUNDING_CAPS};
use crate::error::{IoContext, NvcError, Result};

pub use caps::Capability as Cap;

/// Drops real/effective/saved uid+gid to the target container identity
/// and clears the groups list, then sets `PR_SET_NO_NEW_PRIVS`.
pub fn drop_privileges(uid: Uid, gid: Gid, drop_groups: bool) -> Result<()> {
    if drop_groups {
        unistd::setgroups(&[gid]).io_context("privilege change failed")?;
    }
    if unistd::getegid() != gid {
        unistd::setresgid(gid, gid, gid).io_context("privilege change failed")?;
    }
    if unistd::geteuid() != uid {
        unistd::setresuid(uid, uid, uid).io_context("privilege change failed")?;
    }
    if unistd::getegid() != gid || unistd::geteuid() != uid {
        return Err(NvcError::permission("privilege change failed", "uid/gid mismatch after switch"));
    }
    set_no_new_privs()
}

fn set_no_new_privs() -> Result<()> {
    let rv = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rv < 0 {
        return Err(NvcError::permission("privilege change failed", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Drops every bounding-set capability not in `keep`.
pub fn set_bounds(keep: &[Capability]) -> Result<()> {
    let last_cap = read_last_cap()?;
    for raw in 0..=last_cap {
        let Some(cap) = Capability::from_index(raw) else { continue };
        if keep.contains(&cap) {
            continue;
        }
        let rv = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, raw as libc::c_ulong, 0, 0, 0) };
        if rv < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EINVAL) {
                return Err(NvcError::permission("capability change failed", errno));
            }
        }
    }
    Ok(())
}

fn read_last_cap() -> Result<u8> {
    let text = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap").io_context("capability change failed")?;
    text.trim()
        .parse::<u8>()
        .map_err(|e| NvcError::parse("capability change failed", e))
}

/// Sets the effective+permitted capability sets to exactly `caps`,
/// clearing everything else.
pub fn set_effective(caps: &[Capability]) -> Result<()> {
    let mut set: CapsHashSet = CapsHashSet::new();
    for c in caps {
        set.insert(*c);
    }
    caps::set(None, CapSet::Permitted, &set).map_err(|e| NvcError::permission("capability change failed", e))?;
    caps::set(None, CapSet::Effective, &set).map_err(|e| NvcError::permission("capability change failed", e))?;
    Ok(())
}

/// Clears the inheritable and ambient sets entirely; NVC never hands
/// capabilities across `execve`.
pub fn clear_inheritable() -> Result<()> {
    caps::set(None, CapSet::Inheritable, &CapsHashSet::new()).map_err(|e| NvcError::permission("capability change failed", e))?;
    let rv = unsafe { libc::prctl(libc::PR_CAP_AMBIENT, 4 /* PR_CAP_AMBIENT_CLEAR_ALL */, 0, 0, 0) };
    if rv < 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EINVAL) {
            return Err(NvcError::permission("capability change failed", errno));
        }
    }
    Ok(())
}

/// Restricts the process to the minimal capability set required for
/// `op`, then drops the bounding set down to [`BOUNDING_CAPS`].
pub fn restrict_to(op: Operation) -> Result<()> {
    let keep = ecaps_for(op);
    set_effective(keep)?;
    clear_inheritable()?;
    set_bounds(BOUNDING_CAPS)
}

/// Sets `SECBIT_NO_SETUID_FIXUP`, which stops the kernel from clearing
/// the inheritable/ambient/permitted capability sets across the
/// upcoming `setresuid` away from uid 0. Required so
/// [`raise_ambient`]'s `CAP_DAC_OVERRIDE` survives `drop_privileges`,
/// matching `nvc_ldcache.c`'s `adjust_privileges` for a non-root target
/// uid.
pub fn set_no_setuid_fixup() -> Result<()> {
    let rv = unsafe { libc::prctl(libc::PR_SET_SECUREBITS, libc::SECBIT_NO_SETUID_FIXUP, 0, 0, 0) };
    if rv < 0 {
        return Err(NvcError::permission("privilege change failed", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Adds `cap` to the inheritable set and raises it into the ambient
/// set, so it remains effective for the sandboxed `ldconfig` after
/// `execve` even though the process runs unprivileged. A kernel that
/// refuses the raise (`EPERM`, e.g. missing `PR_SET_SECUREBITS`
/// support) is tolerated: the caller falls back to running without it,
/// matching the original's "when allowed" qualifier.
pub fn raise_ambient(cap: Capability) -> Result<()> {
    let mut inheritable = caps::read(None, CapSet::Inheritable).map_err(|e| NvcError::permission("capability change failed", e))?;
    inheritable.insert(cap);
    caps::set(None, CapSet::Inheritable, &inheritable).map_err(|e| NvcError::permission("capability change failed", e))?;

    let rv = unsafe { libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_RAISE, cap as libc::c_ulong, 0, 0) };
    if rv < 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EPERM) {
            return Err(NvcError::permission("capability change failed", errno));
        }
        log::warn!("could not raise {cap:?} into the ambient set, continuing without it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_last_cap_parses_procfs_value() {
        // Exercises the parse path only; the real /proc file is read,
        // which is always present and numeric on Linux.
        let result = read_last_cap();
        assert!(result.is_ok());
    }
}
