//! Hand-built classic-BPF seccomp allowlist for the sandboxed ldconfig
//! child (C9).
//!
//! Grounded on the kernel's own `seccomp_filter.txt` canonical example:
//! one arch check, then a `JEQ`/`RET_ALLOW` pair per permitted syscall,
//! falling through to a final `RET_ERRNO`. No `libseccomp`/`seccomp-sys`
//! dependency: the filter is built directly over `libc`'s `sock_filter`/
//! `sock_fprog` ABI types and installed with `prctl(PR_SET_SECCOMP)`,
//! the same style of direct `prctl`-driven sandboxing used elsewhere in
//! the example pack (`other_examples/…linux_sandbox.rs`).

use crate::error::{IoContext, Result};

/// `AUDIT_ARCH_X86_64` from `linux/audit.h`
/// (`EM_X86_64 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE`); not exposed by
/// the `libc` crate.
const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;

/// Byte offsets into `struct seccomp_data` (`linux/seccomp.h`).
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

/// The syscalls a sandboxed `ldconfig` may make: file I/O, memory
/// management, directory traversal, process/identity queries, signal
/// return, and nothing else.
const ALLOWED_SYSCALLS: &[i64] = &[
    libc::SYS_access,
    libc::SYS_arch_prctl,
    libc::SYS_brk,
    libc::SYS_chdir,
    libc::SYS_chmod,
    libc::SYS_close,
    libc::SYS_execve,
    libc::SYS_execveat,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_fcntl,
    libc::SYS_fdatasync,
    libc::SYS_fstat,
    libc::SYS_fsync,
    libc::SYS_ftruncate,
    libc::SYS_getcwd,
    libc::SYS_getdents,
    libc::SYS_getdents64,
    libc::SYS_getegid,
    libc::SYS_geteuid,
    libc::SYS_getgid,
    libc::SYS_getpid,
    libc::SYS_gettid,
    libc::SYS_gettimeofday,
    libc::SYS_getuid,
    libc::SYS_lseek,
    libc::SYS_lstat,
    libc::SYS_mkdir,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_mremap,
    libc::SYS_munmap,
    libc::SYS_newfstatat,
    libc::SYS_open,
    libc::SYS_openat,
    libc::SYS_read,
    libc::SYS_readlink,
    libc::SYS_readv,
    libc::SYS_rename,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigreturn,
    libc::SYS_stat,
    libc::SYS_symlink,
    libc::SYS_tgkill,
    libc::SYS_time,
    libc::SYS_uname,
    libc::SYS_unlink,
    libc::SYS_write,
    libc::SYS_writev,
];

fn bpf_stmt(code: u32, k: u32) -> libc::sock_filter {
    libc::sock_filter { code: code as u16, jt: 0, jf: 0, k }
}

fn bpf_jump(code: u32, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code: code as u16, jt, jf, k }
}

/// Builds the allow/deny program: arch guard first (kills the process
/// outright on a foreign ABI, the way a mismatched `x32`/`i386` call
/// would otherwise smuggle a syscall number past the `nr` checks below),
/// then one allow pair per syscall, then deny-by-default.
fn build_program() -> Vec<libc::sock_filter> {
    let mut prog = Vec::with_capacity(4 + ALLOWED_SYSCALLS.len() * 2);

    prog.push(bpf_stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, SECCOMP_DATA_ARCH_OFFSET));
    prog.push(bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, AUDIT_ARCH_X86_64, 1, 0));
    prog.push(bpf_stmt(libc::BPF_RET | libc::BPF_K, libc::SECCOMP_RET_KILL_PROCESS));
    prog.push(bpf_stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, SECCOMP_DATA_NR_OFFSET));

    for &nr in ALLOWED_SYSCALLS {
        prog.push(bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, nr as u32, 0, 1));
        prog.push(bpf_stmt(libc::BPF_RET | libc::BPF_K, libc::SECCOMP_RET_ALLOW));
    }

    prog.push(bpf_stmt(libc::BPF_RET | libc::BPF_K, libc::SECCOMP_RET_ERRNO | (libc::EPERM as u32 & libc::SECCOMP_RET_DATA)));
    prog
}

/// Installs the allowlist via `prctl(PR_SET_SECCOMP)`. Must run after
/// `no_new_privs` is set (`libc::PR_SET_NO_NEW_PRIVS`), per
/// `seccomp(2)`'s unprivileged-filter requirement.
pub fn apply() -> Result<()> {
    let program = build_program();
    let prog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };

    let rc = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog as *const libc::sock_fprog as libc::c_ulong) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).io_context("seccomp filter installation failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_covers_every_allowed_syscall() {
        let prog = build_program();
        assert_eq!(prog.len(), 4 + ALLOWED_SYSCALLS.len() * 2);
    }

    #[test]
    fn program_ends_with_deny_by_default() {
        let prog = build_program();
        let last = prog.last().unwrap();
        assert_eq!(last.code as u32, libc::BPF_RET | libc::BPF_K);
        assert_eq!(last.k, libc::SECCOMP_RET_ERRNO | (libc::EPERM as u32 & libc::SECCOMP_RET_DATA));
    }

    #[test]
    fn program_starts_with_arch_guard() {
        let prog = build_program();
        assert_eq!(prog[0].code as u32, libc::BPF_LD | libc::BPF_W | libc::BPF_ABS);
        assert_eq!(prog[0].k, SECCOMP_DATA_ARCH_OFFSET);
        assert_eq!(prog[1].k, AUDIT_ARCH_X86_64);
    }
}
