// Session signals and the notices we hand to listeners
//
// Austin Shafer - 2024
use std::os::fd::OwnedFd;

/// The type string of a PauseDevice signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// We have to acknowledge with PauseDeviceComplete
    Pause,
    /// Already paused, no acknowledgement
    Force,
    /// The device was unplugged
    Gone,
}

impl PauseKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "pause" => Some(PauseKind::Pause),
            "force" => Some(PauseKind::Force),
            "gone" => Some(PauseKind::Gone),
            _ => None,
        }
    }
}

/// A signal from the session manager
///
/// These are produced on the subscription thread and drained on the
/// main thread.
#[derive(Debug)]
pub enum BusSignal {
    PauseDevice {
        major: u32,
        minor: u32,
        kind: PauseKind,
    },
    /// The device is usable again. The old descriptor is dead and has to
    /// be swapped for this one.
    ResumeDevice { major: u32, minor: u32, fd: OwnedFd },
    /// The session Active property changed
    ActiveChanged(bool),
}

/// What listeners get told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    Paused {
        major: u32,
        minor: u32,
        kind: PauseKind,
    },
    Resumed { major: u32, minor: u32 },
    Active(bool),
}
