//! Option-string parsing for library/driver/container capability sets.
//!
//! Grounded on `original_source/src/options.h`/`options.c`: a
//! space-separated list of option names, each mapped to one or more
//! bits, ORed into a flags word. `OPT_COMPAT32` reused
//! bit 0 on ppc64le in the original (which has no compat32 support);
//! here `Arch` is a separate enum and `ContainerFlags::COMPAT32` keeps
//! a stable bit on every target, with compat32 support gated on `Arch`
//! at the call site instead of bit reuse.

use bitflags::bitflags;

use crate::error::{NvcError, Result};

fn parse_opts(s: &str, table: &[(&str, u32)]) -> Result<u32> {
    let mut flags = 0u32;
    for opt in s.split_whitespace() {
        match table.iter().find(|(name, _)| *name == opt) {
            Some((_, bits)) => flags |= bits,
            None => return Err(NvcError::invalid("invalid option", opt)),
        }
    }
    Ok(flags)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LibraryFlags: u32 {
        const LOAD_KMODS = 1 << 0;
    }
}

impl LibraryFlags {
    pub const DEFAULT: &'static str = "";

    pub fn parse(s: &str) -> Result<Self> {
        const TABLE: &[(&str, u32)] = &[("load-kmods", LibraryFlags::LOAD_KMODS.bits())];
        Ok(LibraryFlags::from_bits_truncate(parse_opts(s, TABLE)?))
    }
}

/// Parsed form of the driver option string, used directly by [`crate::info`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOpts {
    pub no_glvnd: bool,
    pub no_uvm: bool,
    pub no_modeset: bool,
    pub no_mps: bool,
    pub no_persistenced: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct RawDriverFlags: u32 {
        const NO_GLVND = 1 << 0;
        const NO_UVM = 1 << 1;
        const NO_MODESET = 1 << 2;
        const NO_MPS = 1 << 3;
        const NO_PERSISTENCED = 1 << 4;
    }
}

impl DriverOpts {
    pub const DEFAULT: &'static str = "";

    pub fn parse(s: &str) -> Result<Self> {
        const TABLE: &[(&str, u32)] = &[
            ("no-glvnd", RawDriverFlags::NO_GLVND.bits()),
            ("no-uvm", RawDriverFlags::NO_UVM.bits()),
            ("no-modeset", RawDriverFlags::NO_MODESET.bits()),
            ("no-mps", RawDriverFlags::NO_MPS.bits()),
            ("no-persistenced", RawDriverFlags::NO_PERSISTENCED.bits()),
        ];
        let raw = RawDriverFlags::from_bits_truncate(parse_opts(s, TABLE)?);
        Ok(DriverOpts {
            no_glvnd: raw.contains(RawDriverFlags::NO_GLVND),
            no_uvm: raw.contains(RawDriverFlags::NO_UVM),
            no_modeset: raw.contains(RawDriverFlags::NO_MODESET),
            no_mps: raw.contains(RawDriverFlags::NO_MPS),
            no_persistenced: raw.contains(RawDriverFlags::NO_PERSISTENCED),
        })
    }
}

bitflags! {
    /// Container capability request flags. Every variant keeps one
    /// stable bit regardless of target architecture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContainerFlags: u32 {
        const SUPERVISED = 1 << 0;
        const STANDALONE = 1 << 1;
        const NO_CGROUPS = 1 << 2;
        const NO_DEVBIND = 1 << 3;
        const NO_CNTLIBS = 1 << 4;
        const UTILITY_LIBS = 1 << 5;
        const COMPUTE_LIBS = 1 << 6;
        const VIDEO_LIBS = 1 << 7;
        const GRAPHICS_LIBS = 1 << 8;
        const DISPLAY = 1 << 9;
        const UTILITY_BINS = 1 << 10;
        const COMPUTE_BINS = 1 << 11;
        const COMPAT32 = 1 << 12;
    }
}

/// Host architecture, tracked independently of [`ContainerFlags`] so
/// `COMPAT32` never has to double as an arch-specific bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Ppc64le,
}

impl Arch {
    /// ppc64le has no 32-bit compatibility layer; every other arch does.
    pub fn supports_compat32(self) -> bool {
        !matches!(self, Arch::Ppc64le)
    }

    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Arch::Aarch64,
            "powerpc64" => Arch::Ppc64le,
            _ => Arch::X86_64,
        }
    }
}

impl ContainerFlags {
    pub const DEFAULT: &'static str = "standalone no-cgroups no-devbind utility";

    pub fn parse(s: &str) -> Result<Self> {
        const TABLE: &[(&str, u32)] = &[
            ("supervised", ContainerFlags::SUPERVISED.bits()),
            ("standalone", ContainerFlags::STANDALONE.bits()),
            ("no-cgroups", ContainerFlags::NO_CGROUPS.bits()),
            ("no-devbind", ContainerFlags::NO_DEVBIND.bits()),
            ("no-cntlibs", ContainerFlags::NO_CNTLIBS.bits()),
            ("utility", ContainerFlags::UTILITY_BINS.bits() | ContainerFlags::UTILITY_LIBS.bits()),
            ("compute", ContainerFlags::COMPUTE_BINS.bits() | ContainerFlags::COMPUTE_LIBS.bits()),
            ("video", ContainerFlags::VIDEO_LIBS.bits() | ContainerFlags::COMPUTE_LIBS.bits()),
            ("graphics", ContainerFlags::GRAPHICS_LIBS.bits()),
            ("display", ContainerFlags::DISPLAY.bits() | ContainerFlags::GRAPHICS_LIBS.bits()),
            ("compat32", ContainerFlags::COMPAT32.bits()),
        ];
        Ok(ContainerFlags::from_bits_truncate(parse_opts(s, TABLE)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_container_opts_parse() {
        let flags = ContainerFlags::parse(ContainerFlags::DEFAULT).unwrap();
        assert!(flags.contains(ContainerFlags::STANDALONE));
        assert!(flags.contains(ContainerFlags::UTILITY_BINS));
        assert!(flags.contains(ContainerFlags::UTILITY_LIBS));
    }

    #[test]
    fn compute_implies_two_bits() {
        let flags = ContainerFlags::parse("compute").unwrap();
        assert!(flags.contains(ContainerFlags::COMPUTE_BINS));
        assert!(flags.contains(ContainerFlags::COMPUTE_LIBS));
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(ContainerFlags::parse("not-a-real-option").is_err());
    }

    #[test]
    fn ppc64le_never_supports_compat32() {
        assert!(!Arch::Ppc64le.supports_compat32());
        assert!(Arch::X86_64.supports_compat32());
    }
}
