// Finding DRM card nodes with udev
//
// Austin Shafer - 2024
use squall::PciLocation;
use utils::log;

use std::path::PathBuf;

/// The seat devices land on when udev doesn't say otherwise
pub const DEFAULT_SEAT: &str = "seat0";

/// A DRM card node as udev reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// e.g. card0
    pub sysname: String,
    pub devnode: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub seat: String,
    /// Did the firmware use this card for the boot console
    pub boot_vga: bool,
    pub pci: Option<PciLocation>,
}

/// List every DRM card node in the system
///
/// Nodes without a device number are ignored, those are the connector
/// entries udev also files under the drm subsystem.
pub fn scan_drm_nodes() -> std::io::Result<Vec<DeviceNode>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut ret = Vec::new();
    for device in enumerator.scan_devices()? {
        let devnum = match device.devnum() {
            Some(num) => num,
            None => continue,
        };
        let devnode = match device.devnode() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };

        let seat = device
            .property_value("ID_SEAT")
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_SEAT.to_string());

        let mut boot_vga = false;
        let mut pci = None;
        if let Some(parent) = device.parent_with_subsystem("pci")? {
            boot_vga = parent
                .attribute_value("boot_vga")
                .map(|v| v.to_string_lossy().trim() == "1")
                .unwrap_or(false);
            pci = PciLocation::parse(&parent.sysname().to_string_lossy());
        }

        let node = DeviceNode {
            sysname: device.sysname().to_string_lossy().into_owned(),
            devnode: devnode,
            major: nix::sys::stat::major(devnum) as u32,
            minor: nix::sys::stat::minor(devnum) as u32,
            seat: seat,
            boot_vga: boot_vga,
            pci: pci,
        };
        log::debug!("Found DRM node {:?}", node);
        ret.push(node);
    }

    Ok(ret)
}
