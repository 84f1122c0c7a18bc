//! Transport seam between the supervisor and the platform BLE stack.
//!
//! Operations are begin/complete pairs: `begin_*` returns immediately
//! and the outcome arrives as a `TransportEvent`. Attempt boundaries are
//! the cancellable suspension points. Inbound data goes the other way:
//! the adapter decodes characteristic notifications into
//! `DeviceReport`s, which the core loop turns into bus events.

use crossbeam::channel::{Receiver, Sender};

use crate::sequencer::{MachineState, Substate};

/// Outcomes and unsolicited reports from the BLE stack.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectDone {
        address: String,
        result: Result<(), String>,
    },
    DisconnectDone {
        address: String,
    },
    /// Link dropped without a local `begin_disconnect`.
    Disconnected {
        address: String,
    },
    Advertisement {
        address: String,
        name: String,
    },
    ScanFinished,
}

pub trait BleTransport: Send {
    fn begin_connect(&mut self, address: &str);
    fn cancel_connect(&mut self, address: &str);
    fn begin_disconnect(&mut self, address: &str);
    fn begin_scan(&mut self, seconds: f64);
    /// Ask the OS to drop a session this process no longer tracks.
    fn force_disconnect(&mut self, address: &str);
}

/// One decoded DE1 shot sample, before volume accumulation.
#[derive(Debug, Clone)]
pub struct De1Sample {
    /// DE1 clock, seconds.
    pub sample_time: f64,
    pub group_pressure: f64,
    pub group_flow: f64,
    pub mix_temp: f64,
    pub head_temp: f64,
    pub frame_number: u8,
}

/// Decoded readings from the adapters. Characteristic parsing stays in
/// the adapter; by the time data reaches this enum it is in domain
/// units.
#[derive(Debug, Clone)]
pub enum DeviceReport {
    De1State {
        state: MachineState,
        substate: Substate,
    },
    De1ShotSample(De1Sample),
    De1WaterLevel {
        level: f64,
        start_fill_level: f64,
    },
    ScaleWeight {
        scale_time: f64,
        weight: f64,
    },
    ScaleButton {
        button: u8,
    },
    ThermometerReading {
        temperature: f64,
        high_alarm: Option<f64>,
        units: String,
    },
}

/// Scriptable transport for tests: records calls, emits nothing on its
/// own.
pub struct RecordingTransport {
    pub calls: Vec<String>,
    pub events_tx: Sender<TransportEvent>,
    pub events_rx: Receiver<TransportEvent>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        Self {
            calls: Vec::new(),
            events_tx,
            events_rx,
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BleTransport for RecordingTransport {
    fn begin_connect(&mut self, address: &str) {
        self.calls.push(format!("connect {address}"));
    }

    fn cancel_connect(&mut self, address: &str) {
        self.calls.push(format!("cancel {address}"));
    }

    fn begin_disconnect(&mut self, address: &str) {
        self.calls.push(format!("disconnect {address}"));
    }

    fn begin_scan(&mut self, seconds: f64) {
        self.calls.push(format!("scan {seconds}"));
    }

    fn force_disconnect(&mut self, address: &str) {
        self.calls.push(format!("force_disconnect {address}"));
    }
}
