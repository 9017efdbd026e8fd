// Display device enumeration
//
// Walks the DRM card nodes on our seat, takes them through the session,
// and records which outputs they can drive. The result is matched up
// against the Vulkan physical devices by PCI address.
//
// Austin Shafer - 2024
mod edid;
pub mod kms;
mod nodes;


pub use kms::{DisplayOutput, DrmCaps, DrmProbe, KmsInfo, KmsProbe, OutputMode};
pub use nodes::{scan_drm_nodes, DeviceNode, DEFAULT_SEAT};

use crate::cyclone::session::{DeviceFd, SessionBackend, SessionError, TakenDevice};
use squall::{DeviceGate, DeviceId, GpuFleet};
use utils::log;

use thiserror::Error;

/// Why a device node was skipped
#[allow(non_camel_case_types)]
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{node} is assigned to {seat}")]
    WRONG_SEAT { node: String, seat: String },
    #[error("{0} is not a modesetting device")]
    NOT_MODESETTING(String),
    #[error("{0} has no usable outputs")]
    NO_OUTPUTS(String),
    #[error("the session would not give us the device: {0}")]
    TAKE_DEVICE(#[from] SessionError),
    #[error("KMS query failed: {0}")]
    KMS(String),
}

/// A display device we own and can drive
pub struct ManagedDevice {
    pub md_node: DeviceNode,
    pub md_fd: DeviceFd,
    /// Shared with the render targets on this device
    pub md_gate: DeviceGate,
    pub md_caps: DrmCaps,
    pub md_outputs: Vec<DisplayOutput>,
    /// The Vulkan device that drives this card, once resolved
    pub md_physical: Option<DeviceId>,
}

impl ManagedDevice {
    pub fn is_paused(&self) -> bool {
        !self.md_gate.is_active()
    }
}

pub struct DisplayEnumerator<P: KmsProbe> {
    de_probe: P,
}

impl<P: KmsProbe> DisplayEnumerator<P> {
    pub fn new(probe: P) -> Self {
        Self { de_probe: probe }
    }

    /// Probe a device we were handed by the session
    fn manage(&self, taken: TakenDevice) -> Result<ManagedDevice, DeviceError> {
        let info = taken
            .fd
            .with_fd(|fd| self.de_probe.probe(fd, &taken.node))?;

        let outputs: Vec<DisplayOutput> = info
            .outputs
            .into_iter()
            .filter(|o| {
                if !o.is_usable() {
                    log::debug!("{}: output {} can't be driven", taken.node.sysname, o.name);
                }
                o.is_usable()
            })
            .collect();
        if outputs.is_empty() {
            return Err(DeviceError::NO_OUTPUTS(taken.node.sysname.clone()));
        }

        Ok(ManagedDevice {
            md_node: taken.node,
            md_fd: taken.fd,
            md_gate: taken.gate,
            md_caps: info.caps,
            md_outputs: outputs,
            md_physical: None,
        })
    }

    /// Take and probe every display device on the session's seat
    ///
    /// Devices that can't be used are released and skipped, so this may
    /// well return nothing. The boot VGA device comes first.
    pub fn enumerate(
        &self,
        session: &mut SessionBackend,
        nodes: &[DeviceNode],
    ) -> Vec<ManagedDevice> {
        let mut ret = Vec::new();

        for taken in session.take_devices(nodes) {
            let (major, minor) = (taken.node.major, taken.node.minor);
            let name = taken.node.sysname.clone();
            match self.manage(taken) {
                Ok(dev) => {
                    log::info!(
                        "Managing {} with {} outputs",
                        dev.md_node.sysname,
                        dev.md_outputs.len()
                    );
                    ret.push(dev);
                }
                Err(e) => {
                    log::info!("Skipping {}: {}", name, e);
                    session.release_device(major, minor);
                }
            }
        }

        ret
    }
}

/// Match display devices with the physical devices that drive them
///
/// Devices with no matching PCI address in the fleet are handed back to
/// the session and dropped.
pub fn resolve_physical_devices(
    devices: Vec<ManagedDevice>,
    fleet: &GpuFleet,
    session: &mut SessionBackend,
) -> Vec<ManagedDevice> {
    let mut ret = Vec::new();

    for mut dev in devices.into_iter() {
        let id = dev.md_node.pci.as_ref().and_then(|pci| fleet.find_by_pci(pci));
        match id {
            Some(id) => {
                dev.md_physical = Some(id);
                for output in dev.md_outputs.iter_mut() {
                    output.device = Some(id);
                }
                ret.push(dev);
            }
            None => {
                log::error!(
                    "No Vulkan device found for {} ({}), releasing it",
                    dev.md_node.sysname,
                    dev.md_node
                        .pci
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "no PCI address".to_string())
                );
                session.release_device(dev.md_node.major, dev.md_node.minor);
            }
        }
    }

    ret
}
