//! Wire protocol between the parent and the privileged RPC child (C5).
//!
//! `original_source/src/driver.c` drives `libcuda`/`libnvml` through a
//! Sun RPC (`clntunix_create`) transport with XDR-encoded structs, one
//! `*_1_svc` handler per call. This crate keeps the same "typed calls
//! over a private socketpair" shape but replaces Sun RPC/XDR with a
//! `bincode`-serialized, length-prefixed enum. The
//! original's raw `nvmlDevice_t`/`CUdevice` pointers returned to the
//! parent become an opaque [`DeviceHandle`] index into the child's
//! bounded device slab, never a pointer value.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::signal::{sigaction, SigAction, SigHandler, Signal};
use serde::{Deserialize, Serialize};

use crate::error::{NvcError, Result};

/// Opaque handle to a device resolved in the child process. Never a raw
/// pointer: just an index into the child's `MAX_DEVICE_HANDLES`-slot slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Init,
    Shutdown,
    GetRmVersion,
    GetCudaVersion,
    GetDeviceCount,
    GetDevice { index: u32 },
    GetDeviceMinor { dev: DeviceHandle },
    GetDeviceBusid { dev: DeviceHandle },
    GetDeviceUuid { dev: DeviceHandle },
    GetDeviceArch { dev: DeviceHandle },
    GetDeviceModel { dev: DeviceHandle },
    GetDeviceBrand { dev: DeviceHandle },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    RmVersion(String),
    CudaVersion { major: u32, minor: u32 },
    DeviceCount(u32),
    Device(DeviceHandle),
    Minor(u32),
    Busid(String),
    Uuid(String),
    Arch(String),
    Model(String),
    Brand(String),
    Error { message: String },
}

/// Sends `req` and blocks for the matching `Response`, mirroring the
/// `call_rpc` macro's synchronous request/reply pattern: a 10-second
/// send/receive timeout and `SIGPIPE` held at `SIG_IGN` for the
/// duration of the call, so a child that has already exited surfaces as
/// an `EPIPE`-flavored [`NvcError`] rather than killing the caller.
pub fn call(stream: &mut UnixStream, req: &Request) -> Result<Response> {
    stream.set_write_timeout(Some(CALL_TIMEOUT)).map_err(|e| NvcError::rpc("driver rpc failed", e))?;
    stream.set_read_timeout(Some(CALL_TIMEOUT)).map_err(|e| NvcError::rpc("driver rpc failed", e))?;

    let ignore = SigAction::new(SigHandler::SigIgn, nix::sys::signal::SaFlags::empty(), nix::sys::signal::SigSet::empty());
    let previous = unsafe { sigaction(Signal::SIGPIPE, &ignore) }.map_err(|e| NvcError::rpc("driver rpc failed", e))?;

    let result = write_frame(stream, req).and_then(|()| read_frame::<Response>(stream));

    let _ = unsafe { sigaction(Signal::SIGPIPE, &previous) };

    match result? {
        Response::Error { message } => Err(NvcError::rpc("driver rpc failed", message)),
        resp => Ok(resp),
    }
}

pub fn write_frame<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let body = bincode::serialize(value).map_err(|e| NvcError::rpc("driver rpc failed", e))?;
    let len = (body.len() as u32).to_be_bytes();
    stream.write_all(&len).map_err(|e| NvcError::rpc("driver rpc failed", e))?;
    stream.write_all(&body).map_err(|e| NvcError::rpc("driver rpc failed", e))
}

pub fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).map_err(|e| NvcError::rpc("driver rpc failed", e))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(|e| NvcError::rpc("driver rpc failed", e))?;
    bincode::deserialize(&body).map_err(|e| NvcError::rpc("driver rpc failed", e))
}

/// Matches the Sun RPC client's `{10, 0}` timeout in `driver_init`.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(crate::consts::RPC_TIMEOUT_SECS);
