// Seat session management through logind
//
// We don't open DRM nodes ourselves. logind hands us descriptors for
// the devices on our seat, and revokes them when we get switched away
// from. This module tracks the devices we were given and reflects
// pause/resume into each device's `DeviceGate`.
//
// Austin Shafer - 2024
mod events;
pub mod logind;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
mod tests;

pub use events::{BusSignal, PauseKind, SessionNotice};

use crate::cyclone::enumerate::{DeviceError, DeviceNode};
use squall::DeviceGate;
use utils::log;

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;

#[allow(non_camel_case_types)]
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{method} failed: {message}")]
    IPC_FAILED {
        method: &'static str,
        message: String,
    },
    #[error("No graphical session found for uid {0}")]
    NO_SESSION(u32),
    #[error("The session signal stream closed")]
    SIGNALS_CLOSED,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// One entry of ListSessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub uid: u32,
    /// Empty for sessions without a seat, e.g. ssh logins
    pub seat: String,
    pub path: String,
}

/// The calls we make against the session manager
///
/// `LogindBus` is the real thing. Paths are D-Bus object paths.
pub trait SessionBus {
    fn session_by_pid(&self, pid: u32) -> Result<String>;
    fn list_sessions(&self) -> Result<Vec<SessionRecord>>;
    fn get_session(&self, id: &str) -> Result<String>;
    fn get_seat(&self, id: &str) -> Result<String>;
    fn seat_can_graphical(&self, seat_path: &str) -> Result<bool>;
    /// Start delivering PauseDevice/ResumeDevice/PropertiesChanged
    fn subscribe(&self, session_path: &str) -> Result<mpsc::Receiver<BusSignal>>;
    fn take_control(&self, session_path: &str, force: bool) -> Result<()>;
    fn release_control(&self, session_path: &str) -> Result<()>;
    /// Returns the descriptor and whether the device starts out paused
    fn take_device(&self, session_path: &str, major: u32, minor: u32) -> Result<(OwnedFd, bool)>;
    fn release_device(&self, session_path: &str, major: u32, minor: u32) -> Result<()>;
    fn pause_device_complete(&self, session_path: &str, major: u32, minor: u32) -> Result<()>;
}

/// The session we are running in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub seat_id: String,
    pub session_path: String,
    pub seat_path: String,
}

impl Session {
    /// Figure out which session we belong to
    ///
    /// An explicit id wins, then the session of `pid`. If neither gives
    /// us a session on a seat we fall back to the first session of `uid`
    /// on a seat that can do graphics.
    pub fn resolve(
        bus: &dyn SessionBus,
        session_id: Option<&str>,
        uid: u32,
        pid: u32,
    ) -> Result<Self> {
        let sessions = bus.list_sessions()?;

        let candidate = match session_id {
            Some(id) => {
                let found = sessions.iter().find(|s| s.id == id).cloned();
                if found.is_none() {
                    log::error!("Session {} does not exist, searching for one", id);
                }
                found
            }
            None => match bus.session_by_pid(pid) {
                Ok(path) => sessions.iter().find(|s| s.path == path).cloned(),
                Err(e) => {
                    log::debug!("No session for pid {}: {}", pid, e);
                    None
                }
            },
        };

        let record = match candidate.filter(|s| !s.seat.is_empty()) {
            Some(s) => s,
            None => Self::find_graphical(bus, &sessions, uid)?
                .ok_or(SessionError::NO_SESSION(uid))?,
        };

        let ret = Self {
            session_path: bus.get_session(&record.id)?,
            seat_path: bus.get_seat(&record.seat)?,
            session_id: record.id,
            seat_id: record.seat,
        };
        log::info!("Using session {} on {}", ret.session_id, ret.seat_id);
        Ok(ret)
    }

    fn find_graphical(
        bus: &dyn SessionBus,
        sessions: &[SessionRecord],
        uid: u32,
    ) -> Result<Option<SessionRecord>> {
        for s in sessions.iter().filter(|s| s.uid == uid && !s.seat.is_empty()) {
            let seat_path = bus.get_seat(&s.seat)?;
            if bus.seat_can_graphical(&seat_path)? {
                return Ok(Some(s.clone()));
            }
        }
        Ok(None)
    }
}

/// A device descriptor handed out by the session
///
/// Shared between the session, which swaps it on resume, and whoever
/// is using the device.
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<Mutex<OwnedFd>>);

impl DeviceFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(Mutex::new(fd)))
    }

    fn lock(&self) -> MutexGuard<'_, OwnedFd> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn raw(&self) -> RawFd {
        self.lock().as_raw_fd()
    }

    /// Run `func` with the current descriptor
    pub fn with_fd<R, F: FnOnce(BorrowedFd<'_>) -> R>(&self, func: F) -> R {
        let fd = self.lock();
        func(fd.as_fd())
    }

    fn replace(&self, fd: OwnedFd) {
        *self.lock() = fd;
    }
}

/// A device we now own through the session
pub struct TakenDevice {
    pub node: DeviceNode,
    pub fd: DeviceFd,
    pub gate: DeviceGate,
}

struct OwnedDevice {
    od_fd: DeviceFd,
    od_gate: DeviceGate,
}

type NoticeCallback = Box<dyn FnMut(&SessionNotice) + Send>;

#[derive(Default)]
struct ListenerRegistry {
    lr_next_id: u64,
    lr_callbacks: Vec<(u64, NoticeCallback)>,
}

/// Keeps a session listener registered
///
/// The callback is removed when this is dropped. Don't drop a listener
/// from inside a callback, the registry is locked while they run.
pub struct Listener {
    l_id: u64,
    l_registry: Weak<Mutex<ListenerRegistry>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.l_registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            let id = self.l_id;
            registry.lr_callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }
}

/// Our connection to the seat
pub struct SessionBackend {
    sb_bus: Box<dyn SessionBus>,
    sb_session: Session,
    sb_signals: mpsc::Receiver<BusSignal>,
    sb_devices: HashMap<(u32, u32), OwnedDevice>,
    sb_listeners: Arc<Mutex<ListenerRegistry>>,
    sb_has_control: bool,
}

impl SessionBackend {
    /// Find our session and take control of it
    pub fn new(bus: Box<dyn SessionBus>, session_id: Option<&str>) -> Result<Self> {
        let uid = nix::unistd::getuid().as_raw();
        let session = Session::resolve(&*bus, session_id, uid, std::process::id())?;
        Self::open(bus, session)
    }

    /// Take control of an already resolved session
    ///
    /// Failing to take control is fatal, without it we can't get device
    /// descriptors at all.
    pub fn open(bus: Box<dyn SessionBus>, session: Session) -> Result<Self> {
        let signals = bus.subscribe(&session.session_path)?;
        bus.take_control(&session.session_path, false)?;
        log::debug!("Took control of session {}", session.session_id);

        Ok(Self {
            sb_bus: bus,
            sb_session: session,
            sb_signals: signals,
            sb_devices: HashMap::new(),
            sb_listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            sb_has_control: true,
        })
    }

    pub fn session(&self) -> &Session {
        &self.sb_session
    }

    pub fn seat(&self) -> &str {
        &self.sb_session.seat_id
    }

    pub fn is_managed(&self, major: u32, minor: u32) -> bool {
        self.sb_devices.contains_key(&(major, minor))
    }

    /// Take one device node
    pub fn take_device(
        &mut self,
        node: &DeviceNode,
    ) -> std::result::Result<TakenDevice, DeviceError> {
        if node.seat != self.sb_session.seat_id {
            return Err(DeviceError::WRONG_SEAT {
                node: node.sysname.clone(),
                seat: node.seat.clone(),
            });
        }

        let (fd, paused) =
            self.sb_bus
                .take_device(&self.sb_session.session_path, node.major, node.minor)?;
        let fd = DeviceFd::new(fd);
        let gate = DeviceGate::new();
        if paused {
            gate.pause();
        }

        log::debug!(
            "Took {} ({}:{}){}",
            node.sysname,
            node.major,
            node.minor,
            if paused { ", paused" } else { "" }
        );
        self.sb_devices.insert(
            (node.major, node.minor),
            OwnedDevice {
                od_fd: fd.clone(),
                od_gate: gate.clone(),
            },
        );

        Ok(TakenDevice {
            node: node.clone(),
            fd: fd,
            gate: gate,
        })
    }

    /// Take every node on our seat
    ///
    /// Nodes we can't take are logged and skipped. The boot VGA device
    /// is moved to the front.
    pub fn take_devices(&mut self, nodes: &[DeviceNode]) -> Vec<TakenDevice> {
        let mut ret = Vec::new();
        for node in nodes.iter() {
            match self.take_device(node) {
                Ok(dev) if dev.node.boot_vga => ret.insert(0, dev),
                Ok(dev) => ret.push(dev),
                Err(e) => log::info!("Skipping {}: {}", node.sysname, e),
            }
        }
        ret
    }

    /// Give a device back to the session
    pub fn release_device(&mut self, major: u32, minor: u32) {
        if self.sb_devices.remove(&(major, minor)).is_none() {
            return;
        }
        if let Err(e) = self
            .sb_bus
            .release_device(&self.sb_session.session_path, major, minor)
        {
            log::error!("Could not release device {}:{}: {}", major, minor, e);
        }
    }

    /// Register a callback for session notices
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: FnMut(&SessionNotice) + Send + 'static,
    {
        let mut registry = self
            .sb_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = registry.lr_next_id;
        registry.lr_next_id += 1;
        registry.lr_callbacks.push((id, Box::new(callback)));

        Listener {
            l_id: id,
            l_registry: Arc::downgrade(&self.sb_listeners),
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let mut registry = self
            .sb_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, callback) in registry.lr_callbacks.iter_mut() {
            callback(&notice);
        }
    }

    /// Handle every signal that has arrived since the last call
    ///
    /// Returns how many were handled.
    pub fn dispatch(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            match self.sb_signals.try_recv() {
                Ok(signal) => {
                    self.handle_signal(signal);
                    count += 1;
                }
                Err(mpsc::TryRecvError::Empty) => return Ok(count),
                Err(mpsc::TryRecvError::Disconnected) => return Err(SessionError::SIGNALS_CLOSED),
            }
        }
    }

    fn handle_signal(&mut self, signal: BusSignal) {
        match signal {
            BusSignal::PauseDevice { major, minor, kind } => {
                let gate = match self.sb_devices.get(&(major, minor)) {
                    Some(dev) => dev.od_gate.clone(),
                    None => {
                        log::debug!("Ignoring pause of unmanaged device {}:{}", major, minor);
                        return;
                    }
                };
                log::info!("Device {}:{} paused ({:?})", major, minor, kind);

                match kind {
                    PauseKind::Pause => {
                        gate.pause();
                        if let Err(e) = self.sb_bus.pause_device_complete(
                            &self.sb_session.session_path,
                            major,
                            minor,
                        ) {
                            log::error!("Could not acknowledge pause: {}", e);
                        }
                    }
                    PauseKind::Force => gate.pause(),
                    PauseKind::Gone => {
                        gate.mark_gone();
                        // nothing to release, the device no longer exists
                        self.sb_devices.remove(&(major, minor));
                    }
                }
                self.notify(SessionNotice::Paused {
                    major: major,
                    minor: minor,
                    kind: kind,
                });
            }
            BusSignal::ResumeDevice { major, minor, fd } => {
                match self.sb_devices.get(&(major, minor)) {
                    Some(dev) => {
                        dev.od_fd.replace(fd);
                        dev.od_gate.resume();
                    }
                    None => {
                        log::debug!("Ignoring resume of unmanaged device {}:{}", major, minor);
                        return;
                    }
                }
                log::info!("Device {}:{} resumed", major, minor);
                self.notify(SessionNotice::Resumed {
                    major: major,
                    minor: minor,
                });
            }
            BusSignal::ActiveChanged(active) => {
                log::info!(
                    "Session {} is now {}",
                    self.sb_session.session_id,
                    if active { "active" } else { "inactive" }
                );
                self.notify(SessionNotice::Active(active));
            }
        }
    }

    /// Release every device and give up control
    ///
    /// Called on drop if it wasn't called before.
    pub fn teardown(&mut self) {
        if !self.sb_has_control {
            return;
        }

        let path = &self.sb_session.session_path;
        for ((major, minor), _) in self.sb_devices.drain() {
            if let Err(e) = self.sb_bus.release_device(path, major, minor) {
                log::error!("Could not release device {}:{}: {}", major, minor, e);
            }
        }
        if let Err(e) = self.sb_bus.release_control(path) {
            log::error!("Could not release session control: {}", e);
        }
        self.sb_has_control = false;
        log::debug!("Released session {}", self.sb_session.session_id);
    }
}

impl Drop for SessionBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}
