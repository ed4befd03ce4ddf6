//! Structured error model (C11).
//!
//! Every fallible operation in this crate returns [`NvcError`]: a small
//! `(code, message)` pair where `message` is always a single lowercase line.
//! This mirrors `original_source/src/error.c`'s `error_set`/`error_setx`
//! family, which appends a lower-level reason to a contextual phrase.

use std::fmt;

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad argument, unparsable option, unknown subcommand.
    Invalid,
    /// Required file/device absent.
    Missing,
    /// Lack of capability/uid to perform an operation.
    Permission,
    /// Read/write/mount failure at the OS boundary.
    Io,
    /// Malformed procfs/cache/ELF/JSON input.
    Parse,
    /// Vendor-library error.
    Driver,
    /// Transport failure between parent and RPC helper.
    Rpc,
    /// Child exited unexpectedly, signal, or timeout.
    Protocol,
    /// Requirement DSL not satisfied.
    Validation,
}

impl ErrorCode {
    /// The platform errno this code corresponds to, where meaningful.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::Missing => libc::ENOENT,
            ErrorCode::Permission => libc::EPERM,
            ErrorCode::Io => libc::EIO,
            _ => -1,
        }
    }
}

/// A structured error: a stable code plus a single lowercase message line.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NvcError {
    pub code: ErrorCode,
    pub message: String,
}

impl NvcError {
    pub fn new(code: ErrorCode, context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        NvcError {
            code,
            message: format!("{context}: {}", reason.to_string().to_lowercase()),
        }
    }

    pub fn invalid(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Invalid, context, reason)
    }

    pub fn missing(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Missing, context, reason)
    }

    pub fn permission(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Permission, context, reason)
    }

    pub fn io(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Io, context, reason)
    }

    pub fn parse(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Parse, context, reason)
    }

    pub fn driver(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Driver, context, reason)
    }

    pub fn rpc(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Rpc, context, reason)
    }

    pub fn protocol(context: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Protocol, context, reason)
    }

    pub fn validation(atom: impl fmt::Display) -> Self {
        NvcError {
            code: ErrorCode::Validation,
            message: format!("unsatisfied condition: {atom}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, NvcError>;

/// Attaches a contextual phrase to a lower-level I/O error.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl fmt::Display) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NvcError::missing(context, e)
            } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                NvcError::permission(context, e)
            } else {
                NvcError::io(context, e)
            }
        })
    }
}

impl<T> IoContext<T> for std::result::Result<T, nix::Error> {
    fn io_context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| match e {
            nix::Error::ENOENT => NvcError::missing(context, e),
            nix::Error::EPERM | nix::Error::EACCES => NvcError::permission(context, e),
            other => NvcError::io(context, other),
        })
    }
}
