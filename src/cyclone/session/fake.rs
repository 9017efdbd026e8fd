// An in-memory session manager for tests
//
// Austin Shafer - 2024
use super::{BusSignal, Result, SessionBus, SessionError, SessionRecord};
use crate::cyclone::enumerate::DeviceNode;
use squall::PciLocation;

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeState {
    pub sessions: Vec<SessionRecord>,
    pub pid_session: Option<String>,
    /// Seat ids that report CanGraphical
    pub graphical_seats: Vec<String>,
    pub fail_take_control: bool,
    /// Devices come back paused from TakeDevice
    pub start_paused: bool,
    /// Every call made, as "Method args"
    pub calls: Vec<String>,
    pub signals: Option<mpsc::Sender<BusSignal>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBus(pub Arc<Mutex<FakeState>>);

pub(crate) fn session_path(id: &str) -> String {
    format!("/org/freedesktop/login1/session/{}", id)
}

pub(crate) fn seat_path(id: &str) -> String {
    format!("/org/freedesktop/login1/seat/{}", id)
}

pub(crate) fn record(id: &str, uid: u32, seat: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        uid: uid,
        seat: seat.to_string(),
        path: session_path(id),
    }
}

/// A DRM card node, the PCI bus is `minor + 1`
pub(crate) fn node(minor: u32, seat: &str, boot_vga: bool) -> DeviceNode {
    DeviceNode {
        sysname: format!("card{}", minor),
        devnode: PathBuf::from(format!("/dev/dri/card{}", minor)),
        major: 226,
        minor: minor,
        seat: seat.to_string(),
        boot_vga: boot_vga,
        pci: Some(PciLocation::new(0, minor + 1, 0, 0)),
    }
}

pub(crate) fn dev_null() -> OwnedFd {
    OwnedFd::from(File::open("/dev/null").unwrap())
}

impl FakeBus {
    /// One graphical session of the current user on seat0
    pub fn seat0() -> Self {
        let bus = Self::default();
        {
            let mut state = bus.0.lock().unwrap();
            let uid = nix::unistd::getuid().as_raw();
            state.sessions.push(record("1", uid, "seat0"));
            state.pid_session = Some(session_path("1"));
            state.graphical_seats.push("seat0".to_string());
        }
        bus
    }

    fn log(&self, call: String) {
        self.0.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    /// Deliver a signal as if logind sent it
    pub fn send(&self, signal: BusSignal) {
        let state = self.0.lock().unwrap();
        state.signals.as_ref().unwrap().send(signal).unwrap();
    }

    /// Drop our end of the signal channel
    pub fn hang_up(&self) {
        self.0.lock().unwrap().signals = None;
    }
}

impl SessionBus for FakeBus {
    fn session_by_pid(&self, _pid: u32) -> Result<String> {
        self.0
            .lock()
            .unwrap()
            .pid_session
            .clone()
            .ok_or(SessionError::IPC_FAILED {
                method: "GetSessionByPID",
                message: "no session".to_string(),
            })
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.0.lock().unwrap().sessions.clone())
    }

    fn get_session(&self, id: &str) -> Result<String> {
        Ok(session_path(id))
    }

    fn get_seat(&self, id: &str) -> Result<String> {
        Ok(seat_path(id))
    }

    fn seat_can_graphical(&self, path: &str) -> Result<bool> {
        let state = self.0.lock().unwrap();
        Ok(state.graphical_seats.iter().any(|s| seat_path(s) == path))
    }

    fn subscribe(&self, _session_path: &str) -> Result<mpsc::Receiver<BusSignal>> {
        let (tx, rx) = mpsc::channel();
        self.0.lock().unwrap().signals = Some(tx);
        Ok(rx)
    }

    fn take_control(&self, session_path: &str, force: bool) -> Result<()> {
        self.log(format!("TakeControl {} {}", session_path, force));
        if self.0.lock().unwrap().fail_take_control {
            return Err(SessionError::IPC_FAILED {
                method: "TakeControl",
                message: "Device or resource busy".to_string(),
            });
        }
        Ok(())
    }

    fn release_control(&self, _session_path: &str) -> Result<()> {
        self.log("ReleaseControl".to_string());
        Ok(())
    }

    fn take_device(&self, _session_path: &str, major: u32, minor: u32) -> Result<(OwnedFd, bool)> {
        self.log(format!("TakeDevice {}:{}", major, minor));
        let paused = self.0.lock().unwrap().start_paused;
        Ok((dev_null(), paused))
    }

    fn release_device(&self, _session_path: &str, major: u32, minor: u32) -> Result<()> {
        self.log(format!("ReleaseDevice {}:{}", major, minor));
        Ok(())
    }

    fn pause_device_complete(&self, _session_path: &str, major: u32, minor: u32) -> Result<()> {
        self.log(format!("PauseDeviceComplete {}:{}", major, minor));
        Ok(())
    }
}
