//! Fixed paths, device numbers, and capability sets.
//!
//! Grounded on `original_source/src/nvc_internal.h`: the device-node
//! major/minor numbers, socket/procfs paths, and the per-operation
//! capability sets (`pcaps`/`ecaps`/`bcaps`) are carried over literally
//! since they are kernel/driver ABI, not implementation detail.

use caps::Capability;

pub const NV_DEVICE_MAJOR: u64 = 195;
pub const NV_CTL_DEVICE_MINOR: u64 = 255;
pub const NV_MODESET_DEVICE_MINOR: u64 = 254;

pub const NV_CTL_DEVICE_PATH: &str = "/dev/nvidiactl";
pub const NV_UVM_DEVICE_PATH: &str = "/dev/nvidia-uvm";
pub const NV_UVM_TOOLS_DEVICE_PATH: &str = "/dev/nvidia-uvm-tools";
pub const NV_MODESET_DEVICE_PATH: &str = "/dev/nvidia-modeset";
pub const NV_PERSISTENCED_SOCKET: &str = "/var/run/nvidia-persistenced/socket";
pub const NV_MPS_PIPE_DIR: &str = "/tmp/nvidia-mps";
pub const NV_PROC_DRIVER: &str = "/proc/driver/nvidia";
pub const NV_UVM_PROC_DRIVER: &str = "/proc/driver/nvidia-uvm";
pub const NV_APP_PROFILE_DIR: &str = "/etc/nvidia/nvidia-application-profiles-rc.d";

pub const CUDA_RUNTIME_DIR: &str = "/usr/local/cuda";

/// Fixed basenames per capability, used when the driver info scan
/// classifies a binary or library (`match_binary_flags`/`match_library_flags`
/// in `original_source/src/nvc_info.c`).
pub mod binaries {
    pub const UTILITY: &[&str] = &["nvidia-smi", "nvidia-debugdump", "nvidia-persistenced"];
    pub const COMPUTE: &[&str] = &["nvidia-cuda-mps-control", "nvidia-cuda-mps-server"];
}

pub mod libraries {
    pub const UTILITY: &[&str] = &["libnvidia-ml.so", "libnvidia-cfg.so"];
    pub const COMPUTE: &[&str] = &[
        "libcuda.so",
        "libnvidia-opencl.so",
        "libnvidia-ptxjitcompiler.so",
        "libnvidia-fatbinaryloader.so",
        "libnvidia-compiler.so",
    ];
    pub const VIDEO: &[&str] = &["libvdpau_nvidia.so", "libnvidia-encode.so", "libnvidia-opticalflow.so", "libnvcuvid.so"];
    pub const GRAPHICS: &[&str] = &[
        "libnvidia-eglcore.so",
        "libnvidia-glcore.so",
        "libnvidia-tls.so",
        "libnvidia-glsi.so",
        "libnvidia-fbc.so",
        "libnvidia-ifr.so",
    ];
    /// Selected by default (GLVND enabled): NVIDIA's ICD libraries.
    pub const GRAPHICS_GLVND: &[&str] = &[
        "libGLX_nvidia.so",
        "libEGL_nvidia.so",
        "libGLESv2_nvidia.so",
        "libGLESv1_CM_nvidia.so",
        "libnvidia-glvkspirv.so",
    ];
    /// Selected when `OPT_NO_GLVND` is set: legacy non-GLVND libraries.
    pub const GRAPHICS_COMPAT: &[&str] = &["libGL.so", "libEGL.so", "libGLESv1_CM.so", "libGLESv2.so"];
}

/// Privileged capability set needed by any operation of this crate
/// (`pcaps` in `nvc_internal.h`). Bounded below per-operation in
/// [`ecaps_for`].
pub const PRIVILEGED_CAPS: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FOWNER,
    Capability::CAP_KILL,
    Capability::CAP_MKNOD,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_PTRACE,
];

/// Capabilities that stay in the bounding set across privilege drop
/// (`bcaps` in `nvc_internal.h`).
pub const BOUNDING_CAPS: &[Capability] = &[Capability::CAP_DAC_OVERRIDE, Capability::CAP_SYS_MODULE];

/// The high-level operations a context/container session performs,
/// each with its own minimal effective-capability set (`ecaps` table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    InitKmods,
    Shutdown,
    Container,
    Info,
    Mount,
    Ldcache,
}

pub fn ecaps_for(op: Operation) -> &'static [Capability] {
    use Capability::*;
    match op {
        Operation::Init => &[CAP_KILL, CAP_SETUID, CAP_SETGID, CAP_SYS_CHROOT],
        Operation::InitKmods => &[CAP_KILL, CAP_SETUID, CAP_SETGID, CAP_SYS_CHROOT, CAP_CHOWN, CAP_FOWNER, CAP_MKNOD, CAP_SETPCAP],
        Operation::Shutdown => &[CAP_KILL],
        Operation::Container => &[CAP_KILL, CAP_DAC_READ_SEARCH, CAP_SYS_PTRACE],
        Operation::Info => &[CAP_KILL],
        Operation::Mount => &[CAP_KILL, CAP_SETUID, CAP_SETGID, CAP_SYS_CHROOT, CAP_SYS_ADMIN, CAP_DAC_READ_SEARCH, CAP_SYS_PTRACE, CAP_DAC_OVERRIDE],
        Operation::Ldcache => &[CAP_KILL, CAP_SETUID, CAP_SETGID, CAP_SYS_CHROOT, CAP_SYS_ADMIN, CAP_DAC_READ_SEARCH, CAP_SYS_PTRACE, CAP_SETPCAP],
    }
}

/// RPC client timeout, matching the Sun RPC `clntunix_create` timeout of
/// `{10, 0}` in `original_source/src/driver.c`.
pub const RPC_TIMEOUT_SECS: u64 = 10;

/// Upper bound, in milliseconds, the parent polls the RPC socket for
/// `POLLHUP` after sending `shutdown` before escalating to SIGKILL,
/// matching `driver_shutdown`'s `REAP_TIMEOUT_MS` in
/// `original_source/src/driver.c`.
pub const REAP_TIMEOUT_MS: u64 = 10;

/// Number of opaque device handle slots in the RPC child's slab, which
/// replaces raw pointer handles with bounded indices.
pub const MAX_DEVICE_HANDLES: usize = 64;
