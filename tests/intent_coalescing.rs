//! The two-deep intent queue: coalescing, cancellation, and the
//! availability trail they produce.

use std::sync::Arc;

use de1d::config::BluetoothConfig;
use de1d::device::{
    AvailabilityState, DeviceCommand, DeviceRole, DeviceSupervisor, RecordingTransport,
    TransportEvent,
};
use de1d::event::{EventBus, EventKind, ManualClock, Payload};

const ADDR: &str = "D9:B2:48:AA:BB:CC";

#[test]
fn capture_capture_release_from_scratch() {
    let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
    let sub = bus.subscribe("trail", Some(&[EventKind::DeviceAvailability]));

    let transport = RecordingTransport::new();
    let events_rx = transport.events_rx.clone();
    let dir = tempfile::tempdir().unwrap();
    let cfg = BluetoothConfig {
        id_file_directory: dir.path().to_path_buf(),
        ..BluetoothConfig::default()
    };
    let parts = DeviceSupervisor::new(
        DeviceRole::Scale,
        bus.clone(),
        Box::new(transport),
        events_rx,
        cfg,
    );
    let mut sup = parts.supervisor;

    sup.on_command(DeviceCommand::AssignAddress(Some(ADDR.into())), 0.0);
    sup.on_command(DeviceCommand::Capture, 1.0);
    // Coalesced: no state change, no event, no second connect.
    sup.on_command(DeviceCommand::Capture, 1.2);
    // The release cancels the in-flight capture.
    sup.on_command(DeviceCommand::Release, 2.0);
    // The transport reports the aborted connect.
    sup.on_transport_event(
        TransportEvent::ConnectDone {
            address: ADDR.into(),
            result: Err("cancelled".into()),
        },
        2.1,
    );

    let mut trail = Vec::new();
    while let Some(env) = sub.try_recv() {
        if let Payload::DeviceAvailability(d) = env.payload {
            trail.push(d.state);
        }
    }
    assert_eq!(
        trail,
        vec![
            AvailabilityState::Released,
            AvailabilityState::Capturing,
            AvailabilityState::Releasing,
            AvailabilityState::Released,
        ]
    );
    assert!(!parts.handle.is_ready());
    assert_eq!(parts.handle.availability(), AvailabilityState::Released);
}

#[test]
fn assigning_null_forgets_within_one_transition() {
    let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
    let transport = RecordingTransport::new();
    let events_rx = transport.events_rx.clone();
    let dir = tempfile::tempdir().unwrap();
    let cfg = BluetoothConfig {
        id_file_directory: dir.path().to_path_buf(),
        ..BluetoothConfig::default()
    };
    let parts = DeviceSupervisor::new(
        DeviceRole::Scale,
        bus.clone(),
        Box::new(transport),
        events_rx,
        cfg,
    );
    let mut sup = parts.supervisor;

    sup.on_command(DeviceCommand::AssignAddress(Some(ADDR.into())), 0.0);
    sup.on_command(DeviceCommand::Capture, 1.0);
    sup.on_transport_event(
        TransportEvent::ConnectDone {
            address: ADDR.into(),
            result: Ok(()),
        },
        2.0,
    );
    assert_eq!(parts.handle.availability(), AvailabilityState::Ready);

    sup.on_command(DeviceCommand::AssignAddress(None), 3.0);
    let snapshot = parts.handle.snapshot();
    assert_eq!(snapshot.availability, AvailabilityState::Released);
    assert_eq!(snapshot.address, None);
    assert!(!snapshot.ready);
}
