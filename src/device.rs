//! Per-GPU device information (C6, device half).
//!
//! Grounded on `original_source/src/driver.c`'s `driver_get_device_*`
//! family and `nvc_info.c`'s `nvc_device_info_new`: one record per GPU
//! exposed by the driver, carrying identity (UUID, PCI bus id), HW
//! generation, marketing brand, and the `/dev/nvidia<minor>` node.

use std::path::PathBuf;

use crate::consts::NV_DEVICE_MAJOR;
use crate::driver::Driver;
use crate::error::Result;
use crate::info::DeviceNode;

/// Marketing brand tag reported by NVML, mirrored from
/// `nvmlBrandType_t` via `driver_get_device_brand_1_svc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brand {
    Quadro,
    Tesla,
    Nvs,
    Grid,
    Geforce,
    Titan,
    Unknown,
}

impl Brand {
    pub fn as_str(self) -> &'static str {
        match self {
            Brand::Quadro => "Quadro",
            Brand::Tesla => "Tesla",
            Brand::Nvs => "NVS",
            Brand::Grid => "GRID",
            Brand::Geforce => "GeForce",
            Brand::Titan => "TITAN",
            Brand::Unknown => "Unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "Quadro" => Brand::Quadro,
            "Tesla" => Brand::Tesla,
            "NVS" => Brand::Nvs,
            "GRID" => Brand::Grid,
            "GeForce" => Brand::Geforce,
            "TITAN" => Brand::Titan,
            _ => Brand::Unknown,
        }
    }
}

/// One GPU as reported by the driver RPC, plus its device node.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub uuid: String,
    pub busid: String,
    pub arch: String,
    pub brand: Brand,
    pub model: String,
    pub node: DeviceNode,
}

/// Queries the driver for `device_count()` GPUs and assembles one
/// [`DeviceInfo`] per index, mirroring `nvc_device_info_new`'s loop over
/// `driver_get_device_count`/`driver_get_device`.
pub fn device_info_new(driver: &mut Driver) -> Result<Vec<DeviceInfo>> {
    let count = driver.get_device_count()?;
    log::info!("requesting device information with no options");

    let mut devices = Vec::with_capacity(count as usize);
    for i in 0..count {
        let handle = driver.get_device(i)?;
        let minor = driver.get_device_minor(handle)?;
        let busid = driver.get_device_busid(handle)?;
        let uuid = driver.get_device_uuid(handle)?;
        let arch = driver.get_device_arch(handle)?;
        let model = driver.get_device_model(handle)?;
        let brand = Brand::parse(&driver.get_device_brand(handle)?);

        let node = DeviceNode {
            path: PathBuf::from(format!("/dev/nvidia{minor}")),
            rdev: nix::sys::stat::makedev(NV_DEVICE_MAJOR, minor as u64),
        };

        log::info!("listing device {} ({})", node.path.display(), busid);
        devices.push(DeviceInfo {
            uuid,
            busid,
            arch,
            brand,
            model,
            node,
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_round_trips_known_tags() {
        for tag in ["Quadro", "Tesla", "NVS", "GRID", "GeForce", "TITAN"] {
            assert_eq!(Brand::parse(tag).as_str(), tag);
        }
    }

    #[test]
    fn unknown_brand_tag_falls_back() {
        assert_eq!(Brand::parse("Garbage").as_str(), "Unknown");
    }
}
