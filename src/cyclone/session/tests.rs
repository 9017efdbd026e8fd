// Session tests against the in-memory bus
//
// Austin Shafer - 2024
use super::fake::{dev_null, node, record, seat_path, session_path, FakeBus};
use super::*;
use squall::GateState;

use std::sync::atomic::{AtomicUsize, Ordering};

fn backend(bus: &FakeBus) -> SessionBackend {
    SessionBackend::new(Box::new(bus.clone()), None).unwrap()
}

#[test]
fn resolve_by_pid() {
    let bus = FakeBus::seat0();
    let session = Session::resolve(&bus, None, 1000, 42).unwrap();
    assert_eq!(session.session_id, "1");
    assert_eq!(session.seat_id, "seat0");
    assert_eq!(session.session_path, session_path("1"));
    assert_eq!(session.seat_path, seat_path("seat0"));
}

#[test]
fn explicit_session_wins() {
    let bus = FakeBus::seat0();
    bus.0
        .lock()
        .unwrap()
        .sessions
        .push(record("c7", 1000, "seat1"));

    let session = Session::resolve(&bus, Some("c7"), 1000, 42).unwrap();
    assert_eq!(session.session_id, "c7");
    assert_eq!(session.seat_id, "seat1");
}

#[test]
fn falls_back_to_graphical_seat() {
    let bus = FakeBus::default();
    {
        let mut state = bus.0.lock().unwrap();
        // our ssh login, another user's desktop, a headless seat, then ours
        state.sessions.push(record("3", 1000, ""));
        state.sessions.push(record("4", 1001, "seat0"));
        state.sessions.push(record("5", 1000, "seat9"));
        state.sessions.push(record("6", 1000, "seat0"));
        state.pid_session = Some(session_path("3"));
        state.graphical_seats.push("seat0".to_string());
    }

    let session = Session::resolve(&bus, None, 1000, 42).unwrap();
    assert_eq!(session.session_id, "6");

    match Session::resolve(&bus, None, 2000, 42) {
        Err(SessionError::NO_SESSION(2000)) => {}
        other => panic!("expected no session, got {:?}", other),
    }
}

#[test]
fn take_control_failure_is_fatal() {
    let bus = FakeBus::seat0();
    bus.0.lock().unwrap().fail_take_control = true;
    assert!(SessionBackend::new(Box::new(bus.clone()), None).is_err());
}

#[test]
fn wrong_seat_is_skipped_and_boot_vga_first() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);

    let nodes = [
        node(0, "seat0", false),
        node(1, "seat1", false),
        node(2, "seat0", true),
    ];
    let taken = session.take_devices(&nodes);
    let minors: Vec<u32> = taken.iter().map(|d| d.node.minor).collect();
    assert_eq!(minors, vec![2, 0]);

    assert!(!bus.calls().iter().any(|c| c == "TakeDevice 226:1"));
    assert!(session.is_managed(226, 0));
    assert!(!session.is_managed(226, 1));
}

#[test]
fn devices_can_start_paused() {
    let bus = FakeBus::seat0();
    bus.0.lock().unwrap().start_paused = true;
    let mut session = backend(&bus);

    let dev = session.take_device(&node(0, "seat0", false)).unwrap();
    assert_eq!(dev.gate.state(), GateState::Paused);
}

#[test]
fn pause_kinds() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);
    let a = session.take_device(&node(0, "seat0", false)).unwrap();
    let b = session.take_device(&node(1, "seat0", false)).unwrap();
    let c = session.take_device(&node(2, "seat0", false)).unwrap();

    bus.send(BusSignal::PauseDevice {
        major: 226,
        minor: 0,
        kind: PauseKind::Pause,
    });
    bus.send(BusSignal::PauseDevice {
        major: 226,
        minor: 1,
        kind: PauseKind::Force,
    });
    bus.send(BusSignal::PauseDevice {
        major: 226,
        minor: 2,
        kind: PauseKind::Gone,
    });
    assert_eq!(session.dispatch().unwrap(), 3);

    assert_eq!(a.gate.state(), GateState::Paused);
    assert_eq!(b.gate.state(), GateState::Paused);
    assert_eq!(c.gate.state(), GateState::Gone);

    let calls = bus.calls();
    assert!(calls.iter().any(|c| c == "PauseDeviceComplete 226:0"));
    assert!(!calls.iter().any(|c| c == "PauseDeviceComplete 226:1"));
    assert!(!session.is_managed(226, 2));
}

#[test]
fn resume_swaps_descriptor() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);
    let dev = session.take_device(&node(0, "seat0", false)).unwrap();

    bus.send(BusSignal::PauseDevice {
        major: 226,
        minor: 0,
        kind: PauseKind::Force,
    });
    session.dispatch().unwrap();
    assert!(!dev.gate.is_active());

    let fresh = dev_null();
    let fresh_raw = fresh.as_raw_fd();
    bus.send(BusSignal::ResumeDevice {
        major: 226,
        minor: 0,
        fd: fresh,
    });
    session.dispatch().unwrap();

    assert!(dev.gate.is_active());
    assert_eq!(dev.fd.raw(), fresh_raw);
}

#[test]
fn listeners_unregister_on_drop() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let listener = session.listen(move |notice| {
        if let SessionNotice::Active(false) = notice {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    bus.send(BusSignal::ActiveChanged(false));
    session.dispatch().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    drop(listener);
    bus.send(BusSignal::ActiveChanged(false));
    session.dispatch().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn closed_signal_stream_is_an_error() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);
    assert_eq!(session.dispatch().unwrap(), 0);

    bus.hang_up();
    match session.dispatch() {
        Err(SessionError::SIGNALS_CLOSED) => {}
        other => panic!("expected closed stream, got {:?}", other),
    }
}

#[test]
fn teardown_releases_everything_once() {
    let bus = FakeBus::seat0();
    let mut session = backend(&bus);
    session.take_device(&node(0, "seat0", false)).unwrap();
    session.take_device(&node(1, "seat0", false)).unwrap();

    session.teardown();
    drop(session);

    let calls = bus.calls();
    let releases = calls
        .iter()
        .filter(|c| c.starts_with("ReleaseDevice"))
        .count();
    assert_eq!(releases, 2);
    assert_eq!(calls.iter().filter(|c| *c == "ReleaseControl").count(), 1);
    assert_eq!(calls.last().map(|c| c.as_str()), Some("ReleaseControl"));
}
