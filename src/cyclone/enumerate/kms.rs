// KMS queries over drm-rs
//
// Austin Shafer - 2024
extern crate drm;

use drm::control::{connector, Device as ControlDevice, Mode, ModeTypeFlags, PlaneType};
use drm::{ClientCapability, Device as DrmDeviceTrait, DriverCapability};

use super::edid::MonitorInfo;
use super::nodes::DeviceNode;
use super::DeviceError;
use squall::DeviceId;
use utils::log;

use bitflags::bitflags;
use std::os::unix::io::{AsFd, BorrowedFd};

bitflags! {
    /// The driver capabilities we care about
    pub struct DrmCaps: u32 {
        const DUMB_BUFFER = 1 << 0;
        const PRIME = 1 << 1;
        const ATOMIC = 1 << 2;
        const ADDFB2_MODIFIERS = 1 << 3;
        const ASYNC_PAGE_FLIP = 1 << 4;
        const TIMESTAMP_MONOTONIC = 1 << 5;
    }
}

/// One mode a connector advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
    pub preferred: bool,
}

impl OutputMode {
    fn from_drm(mode: &Mode) -> Self {
        let (width, height) = mode.size();
        Self {
            width: width as u32,
            height: height as u32,
            refresh_mhz: mode.vrefresh() * 1000,
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        }
    }
}

/// A connected connector on a card
#[derive(Debug, Clone)]
pub struct DisplayOutput {
    pub connector_id: u32,
    /// e.g. DP-1
    pub name: String,
    /// From the EDID monitor descriptor
    pub monitor: Option<String>,
    /// Indices into the card's CRTC list that can drive this output
    pub crtcs: Vec<usize>,
    /// The CRTC index this output scans out from
    pub crtc: Option<usize>,
    /// Primary plane of the assigned CRTC
    pub primary_plane: Option<u32>,
    pub modes: Vec<OutputMode>,
    /// The mode the assigned CRTC is already running, if it is lit
    pub current_mode: Option<OutputMode>,
    /// The physical device this output is scanned out from
    pub device: Option<DeviceId>,
}

impl DisplayOutput {
    /// The preferred mode, or the first one if none is flagged
    pub fn preferred_mode(&self) -> Option<OutputMode> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
            .copied()
    }

    /// The mode to start in, keeping whatever is already on screen
    pub fn startup_mode(&self) -> Option<OutputMode> {
        self.current_mode.or_else(|| self.preferred_mode())
    }

    /// Can this output actually be lit up
    pub fn is_usable(&self) -> bool {
        self.crtc.is_some() && !self.modes.is_empty()
    }
}

/// Pick the CRTC for a connector
///
/// The one already driving it wins, otherwise the lowest candidate that
/// no other connector on the card has claimed.
pub fn assign_crtc(current: Option<usize>, candidates: &[usize], taken: &[usize]) -> Option<usize> {
    let free = |idx: &usize| !taken.contains(idx);
    current
        .filter(|idx| candidates.contains(idx) && free(idx))
        .or_else(|| candidates.iter().copied().find(|idx| free(idx)))
}

/// What a KMS probe learned about a card
#[derive(Debug, Clone)]
pub struct KmsInfo {
    pub caps: DrmCaps,
    pub outputs: Vec<DisplayOutput>,
}

/// Queries a card's modesetting state
///
/// The fd is the one handed back by the session for `node`.
pub trait KmsProbe {
    fn probe(&self, fd: BorrowedFd<'_>, node: &DeviceNode) -> Result<KmsInfo, DeviceError>;
}

/// A borrowed DRM fd that drm-rs can talk to
struct DrmCard<'a> {
    dc_fd: BorrowedFd<'a>,
}

impl AsFd for DrmCard<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.dc_fd
    }
}

impl DrmDeviceTrait for DrmCard<'_> {}
impl ControlDevice for DrmCard<'_> {}

/// The real probe, backed by the kernel
pub struct DrmProbe;

impl DrmProbe {
    fn caps(card: &DrmCard) -> DrmCaps {
        let mut caps = DrmCaps::empty();
        let driver_caps = [
            (DriverCapability::DumbBuffer, DrmCaps::DUMB_BUFFER),
            (DriverCapability::Prime, DrmCaps::PRIME),
            (DriverCapability::AddFB2Modifiers, DrmCaps::ADDFB2_MODIFIERS),
            (DriverCapability::ASyncPageFlip, DrmCaps::ASYNC_PAGE_FLIP),
            (
                DriverCapability::MonotonicTimestamp,
                DrmCaps::TIMESTAMP_MONOTONIC,
            ),
        ];
        for (cap, flag) in driver_caps.iter() {
            if let Ok(val) = card.get_driver_capability(*cap) {
                if val != 0 {
                    caps |= *flag;
                }
            }
        }

        // Atomic is a client cap, the driver has it if it lets us turn it on
        if card
            .set_client_capability(ClientCapability::Atomic, true)
            .is_ok()
        {
            caps |= DrmCaps::ATOMIC;
        }

        caps
    }

    fn monitor_name(card: &DrmCard, conn: connector::Handle) -> Option<String> {
        let props = card.get_properties(conn).ok()?;
        for (&id, &val) in props.iter() {
            let info = match card.get_property(id) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if info.name().to_str().map(|n| n == "EDID").unwrap_or(false) {
                if val == 0 {
                    return None;
                }
                let blob = card.get_property_blob(val).ok()?;
                return MonitorInfo::parse(&blob).map(|info| info.display_name());
            }
        }
        None
    }

    /// The CRTC index driving `conn` right now and the mode it runs
    fn current_crtc(
        card: &DrmCard,
        res: &drm::control::ResourceHandles,
        conn: &connector::Info,
    ) -> (Option<usize>, Option<OutputMode>) {
        let crtc = conn
            .current_encoder()
            .and_then(|enc| card.get_encoder(enc).ok())
            .and_then(|info| info.crtc());
        let crtc = match crtc {
            Some(crtc) => crtc,
            None => return (None, None),
        };

        let idx = res.crtcs().iter().position(|&c| c == crtc);
        let mode = card
            .get_crtc(crtc)
            .ok()
            .and_then(|info| info.mode())
            .map(|mode| OutputMode::from_drm(&mode));
        (idx, mode)
    }

    /// Find the primary plane that can be used with `crtc`
    fn primary_plane(
        card: &DrmCard,
        res: &drm::control::ResourceHandles,
        crtc: drm::control::crtc::Handle,
    ) -> Option<u32> {
        let planes = card.plane_handles().ok()?;
        planes
            .iter()
            .find(|&&plane| {
                let info = match card.get_plane(plane) {
                    Ok(info) => info,
                    Err(_) => return false,
                };
                // verify this plane supports our crtc
                if !res.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
                    return false;
                }

                let props = match card.get_properties(plane) {
                    Ok(props) => props,
                    Err(_) => return false,
                };
                for (&id, &val) in props.iter() {
                    if let Ok(prop_info) = card.get_property(id) {
                        if prop_info
                            .name()
                            .to_str()
                            .map(|x| x == "type")
                            .unwrap_or(false)
                        {
                            return val == (PlaneType::Primary as u32).into();
                        }
                    }
                }
                false
            })
            .map(|&plane| u32::from(plane))
    }
}

impl KmsProbe for DrmProbe {
    fn probe(&self, fd: BorrowedFd<'_>, node: &DeviceNode) -> Result<KmsInfo, DeviceError> {
        let card = DrmCard { dc_fd: fd };

        // Render only nodes have no mode setting resources
        let res = card
            .resource_handles()
            .map_err(|_| DeviceError::NOT_MODESETTING(node.sysname.clone()))?;
        let caps = Self::caps(&card);
        log::debug!("{} capabilities: {:?}", node.sysname, caps);

        let mut outputs = Vec::new();
        let mut taken = Vec::new();
        for &handle in res.connectors() {
            let conn = card
                .get_connector(handle, false)
                .map_err(|e| DeviceError::KMS(format!("getting connector: {}", e)))?;
            if conn.state() != connector::State::Connected {
                continue;
            }

            // The usable CRTCs are the union of every encoder's mask
            let mut crtcs = Vec::new();
            for &enc in conn.encoders() {
                let enc_info = match card.get_encoder(enc) {
                    Ok(info) => info,
                    Err(e) => {
                        log::debug!("Skipping encoder {:?}: {}", enc, e);
                        continue;
                    }
                };
                for crtc in res.filter_crtcs(enc_info.possible_crtcs()) {
                    if let Some(idx) = res.crtcs().iter().position(|&c| c == crtc) {
                        if !crtcs.contains(&idx) {
                            crtcs.push(idx);
                        }
                    }
                }
            }
            crtcs.sort_unstable();

            let (current, current_mode) = Self::current_crtc(&card, &res, &conn);
            let crtc = assign_crtc(current, &crtcs, &taken);
            if let Some(idx) = crtc {
                taken.push(idx);
            }
            let primary_plane =
                crtc.and_then(|idx| Self::primary_plane(&card, &res, res.crtcs()[idx]));
            // A mode left on some other CRTC is no use to us
            let current_mode = current_mode.filter(|_| current.is_some() && current == crtc);

            let output = DisplayOutput {
                connector_id: u32::from(handle),
                name: format!("{}-{}", conn.interface().as_str(), conn.interface_id()),
                monitor: Self::monitor_name(&card, handle),
                crtcs: crtcs,
                crtc: crtc,
                primary_plane: primary_plane,
                modes: conn.modes().iter().map(OutputMode::from_drm).collect(),
                current_mode: current_mode,
                device: None,
            };
            log::info!(
                "{}: output {} ({}) with {} modes on CRTC {:?}",
                node.sysname,
                output.name,
                output.monitor.as_deref().unwrap_or("unknown monitor"),
                output.modes.len(),
                output.crtc
            );
            outputs.push(output);
        }

        Ok(KmsInfo {
            caps: caps,
            outputs: outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(preferred: Option<usize>, modes: usize, crtcs: Vec<usize>) -> DisplayOutput {
        DisplayOutput {
            connector_id: 40,
            name: "DP-1".to_string(),
            monitor: None,
            crtc: crtcs.first().copied(),
            crtcs: crtcs,
            primary_plane: None,
            current_mode: None,
            modes: (0..modes)
                .map(|i| OutputMode {
                    width: 1920 - i as u32 * 100,
                    height: 1080,
                    refresh_mhz: 60000,
                    preferred: preferred == Some(i),
                })
                .collect(),
            device: None,
        }
    }

    #[test]
    fn preferred_mode_fallback() {
        assert_eq!(output(Some(2), 3, vec![0]).preferred_mode().unwrap().width, 1720);
        assert_eq!(output(None, 3, vec![0]).preferred_mode().unwrap().width, 1920);
        assert!(output(None, 0, vec![0]).preferred_mode().is_none());
    }

    #[test]
    fn crtc_assignment() {
        // keep the one that is already lit
        assert_eq!(assign_crtc(Some(1), &[0, 1, 2], &[]), Some(1));
        // unless someone else already has it
        assert_eq!(assign_crtc(Some(1), &[0, 1, 2], &[0, 1]), Some(2));
        assert_eq!(assign_crtc(Some(3), &[0, 1], &[]), Some(0));
        assert_eq!(assign_crtc(None, &[0, 1], &[0]), Some(1));
        assert_eq!(assign_crtc(None, &[0], &[0]), None);
        assert_eq!(assign_crtc(None, &[], &[]), None);
    }

    #[test]
    fn usable_outputs() {
        assert!(output(None, 1, vec![1]).is_usable());
        assert!(!output(None, 1, vec![]).is_usable());
        assert!(!output(None, 0, vec![0, 1]).is_usable());
    }
}
