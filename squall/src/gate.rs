// Device access gate
//
// The session manager can revoke our access to a GPU at any time. The
// session side flips the gate and render targets check it before every
// frame.
//
// Austin Shafer - 2024
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const GATE_ACTIVE: u8 = 0;
const GATE_PAUSED: u8 = 1;
const GATE_GONE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Active,
    /// Access was revoked, it may come back
    Paused,
    /// The device was removed
    Gone,
}

/// Shared pause/resume switch for one device
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct DeviceGate {
    g_state: Arc<AtomicU8>,
}

impl Default for DeviceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceGate {
    pub fn new() -> Self {
        Self {
            g_state: Arc::new(AtomicU8::new(GATE_ACTIVE)),
        }
    }

    pub fn state(&self) -> GateState {
        match self.g_state.load(Ordering::Acquire) {
            GATE_ACTIVE => GateState::Active,
            GATE_PAUSED => GateState::Paused,
            _ => GateState::Gone,
        }
    }

    /// Can we submit work to this device right now
    pub fn is_active(&self) -> bool {
        self.state() == GateState::Active
    }

    pub fn pause(&self) {
        // Gone is final
        let _ = self.g_state.compare_exchange(
            GATE_ACTIVE,
            GATE_PAUSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn resume(&self) {
        let _ = self.g_state.compare_exchange(
            GATE_PAUSED,
            GATE_ACTIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_gone(&self) {
        self.g_state.store(GATE_GONE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_gone() {
        let gate = DeviceGate::new();
        let other = gate.clone();
        assert!(gate.is_active());

        other.pause();
        assert_eq!(gate.state(), GateState::Paused);
        other.resume();
        assert!(gate.is_active());

        gate.mark_gone();
        other.resume();
        assert_eq!(other.state(), GateState::Gone);
        other.pause();
        assert_eq!(other.state(), GateState::Gone);
    }
}
