//! Driver RPC channel (C5): forks a privileged child that loads the
//! NVIDIA vendor libraries and answers typed requests over a socketpair.
//!
//! Grounded on `original_source/src/driver.c`'s `driver_init`/
//! `driver_shutdown` and the `driver_get_*` call family.

pub mod child;
mod ffi;
pub mod rpc;

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};

use crate::consts::REAP_TIMEOUT_MS;
use crate::error::{NvcError, Result};

pub use rpc::DeviceHandle;

pub struct Driver {
    stream: UnixStream,
    child: Pid,
}

impl Driver {
    /// Forks the RPC child rooted at `root`, running as `uid`/`gid`.
    pub fn init(root: &Path, uid: Uid, gid: Gid, drop_groups: bool) -> Result<Self> {
        let (parent_sock, child_sock) = UnixStream::pair().map_err(|e| NvcError::rpc("driver rpc failed", e))?;
        let root = root.to_path_buf();
        let parent_pid = std::process::id() as i32;

        match unsafe { fork() }.map_err(|e| NvcError::protocol("process creation failed", e))? {
            ForkResult::Parent { child } => {
                drop(child_sock);
                Ok(Driver { stream: parent_sock, child })
            }
            ForkResult::Child => {
                drop(parent_sock);
                child::run(child_sock, &root, uid, gid, drop_groups, parent_pid);
            }
        }
    }

    fn call(&mut self, req: rpc::Request) -> Result<rpc::Response> {
        rpc::call(&mut self.stream, &req)
    }

    pub fn get_rm_version(&mut self) -> Result<String> {
        match self.call(rpc::Request::GetRmVersion)? {
            rpc::Response::RmVersion(v) => Ok(v),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_cuda_version(&mut self) -> Result<String> {
        match self.call(rpc::Request::GetCudaVersion)? {
            rpc::Response::CudaVersion { major, minor } => Ok(format!("{major}.{minor}")),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_count(&mut self) -> Result<u32> {
        match self.call(rpc::Request::GetDeviceCount)? {
            rpc::Response::DeviceCount(n) => Ok(n),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device(&mut self, index: u32) -> Result<DeviceHandle> {
        match self.call(rpc::Request::GetDevice { index })? {
            rpc::Response::Device(h) => Ok(h),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_minor(&mut self, dev: DeviceHandle) -> Result<u32> {
        match self.call(rpc::Request::GetDeviceMinor { dev })? {
            rpc::Response::Minor(m) => Ok(m),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_busid(&mut self, dev: DeviceHandle) -> Result<String> {
        match self.call(rpc::Request::GetDeviceBusid { dev })? {
            rpc::Response::Busid(s) => Ok(s),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_uuid(&mut self, dev: DeviceHandle) -> Result<String> {
        match self.call(rpc::Request::GetDeviceUuid { dev })? {
            rpc::Response::Uuid(s) => Ok(s),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_arch(&mut self, dev: DeviceHandle) -> Result<String> {
        match self.call(rpc::Request::GetDeviceArch { dev })? {
            rpc::Response::Arch(s) => Ok(s),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_model(&mut self, dev: DeviceHandle) -> Result<String> {
        match self.call(rpc::Request::GetDeviceModel { dev })? {
            rpc::Response::Model(s) => Ok(s),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    pub fn get_device_brand(&mut self, dev: DeviceHandle) -> Result<String> {
        match self.call(rpc::Request::GetDeviceBrand { dev })? {
            rpc::Response::Brand(s) => Ok(s),
            _ => Err(NvcError::protocol("driver rpc failed", "unexpected response")),
        }
    }

    /// Sends the shutdown request, then polls for the child hanging up
    /// its end of the socket within `REAP_TIMEOUT_MS`; regardless of
    /// that outcome it forces the issue with SIGKILL and reaps
    /// unconditionally, matching `driver_shutdown`'s
    /// poll-then-force-kill sequence: the child's
    /// pid must not be waitable after this returns.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.call(rpc::Request::Shutdown);

        let fd = self.stream.as_raw_fd();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLHUP)];
        let _ = poll(&mut fds, PollTimeout::from(REAP_TIMEOUT_MS as u16));

        let _ = kill(self.child, Signal::SIGKILL);
        loop {
            match waitpid(self.child, None) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(_) => return Ok(()),
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::ECHILD) => return Ok(()),
                Err(e) => return Err(NvcError::protocol("process reaping failed", e)),
            }
        }
    }
}

pub const SONAME_LIBCUDA: &str = "libcuda.so.1";
pub const SONAME_LIBNVML: &str = "libnvidia-ml.so.1";
