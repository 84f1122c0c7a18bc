//! Typed event payloads and the envelope that carries them.
//!
//! The JSON rendering of an envelope is
//! `{version, class, sender, arrival_time, create_time, event_time, ...}`
//! with the kind-specific fields flattened alongside.

use serde::{Deserialize, Serialize};

use crate::device::DeviceRole;
use crate::sequencer::MachineState;

/// Event kinds marked for capture and external notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateUpdate,
    ShotSample,
    WeightAndFlow,
    WaterLevel,
    SequencerGate,
    StopAt,
    ScaleTare,
    AutoTare,
    ScaleButton,
    Connectivity,
    DeviceAvailability,
    DeviceChanged,
    ScaleChange,
    BlueDotUpdate,
    ScanReport,
}

impl EventKind {
    /// Wire/class name, also the store table discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateUpdate => "StateUpdate",
            EventKind::ShotSample => "ShotSampleWithVolumesUpdate",
            EventKind::WeightAndFlow => "WeightAndFlowUpdate",
            EventKind::WaterLevel => "WaterLevelUpdate",
            EventKind::SequencerGate => "SequencerGateNotification",
            EventKind::StopAt => "StopAtNotification",
            EventKind::ScaleTare => "ScaleTareSeen",
            EventKind::AutoTare => "AutoTareNotification",
            EventKind::ScaleButton => "ScaleButtonPress",
            EventKind::Connectivity => "ConnectivityChange",
            EventKind::DeviceAvailability => "DeviceAvailability",
            EventKind::DeviceChanged => "DeviceChanged",
            EventKind::ScaleChange => "ScaleChange",
            EventKind::BlueDotUpdate => "BlueDotUpdate",
            EventKind::ScanReport => "ScannerNotification",
        }
    }
}

/// Machine state and substate transition, as reported by the DE1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state: MachineState,
    pub substate: crate::sequencer::Substate,
    pub previous_state: MachineState,
    pub previous_substate: crate::sequencer::Substate,
}

/// One DE1 shot sample with accumulated volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotSample {
    pub de1_time: f64,
    pub group_pressure: f64,
    pub group_flow: f64,
    pub mix_temp: f64,
    pub head_temp: f64,
    pub frame_number: u8,
    pub volume_preinfuse: f64,
    pub volume_pour: f64,
    pub volume_total: f64,
}

/// Scale-processor output: smoothed weight and estimated flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightAndFlow {
    pub scale_time: f64,
    pub current_weight: f64,
    pub current_weight_time: f64,
    pub average_flow: f64,
    pub average_flow_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterLevel {
    pub level: f64,
    pub start_fill_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Set,
    Clear,
}

/// The eight shot-phase gates. Wire names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateName {
    #[serde(rename = "sequence_start")]
    SequenceStart,
    #[serde(rename = "sequence_flow_begin")]
    FlowBegin,
    #[serde(rename = "sequence_expect_drops")]
    ExpectDrops,
    #[serde(rename = "sequence_exit_preinfuse")]
    ExitPreinfuse,
    #[serde(rename = "sequence_flow_end")]
    FlowEnd,
    #[serde(rename = "sequence_flow_state_exit")]
    FlowStateExit,
    #[serde(rename = "sequence_last_drops")]
    LastDrops,
    #[serde(rename = "sequence_complete")]
    SequenceComplete,
}

pub const ALL_GATES: [GateName; 8] = [
    GateName::SequenceStart,
    GateName::FlowBegin,
    GateName::ExpectDrops,
    GateName::ExitPreinfuse,
    GateName::FlowEnd,
    GateName::FlowStateExit,
    GateName::LastDrops,
    GateName::SequenceComplete,
];

/// Why a sequence closed, when not by its natural gate progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Watchdog,
    DeviceLost,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerGateNotification {
    pub name: GateName,
    pub action: GateAction,
    pub sequence_id: String,
    pub active_state: MachineState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<CloseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAtKind {
    Time,
    Volume,
    Weight,
}

impl StopAtKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopAtKind::Time => "time",
            StopAtKind::Volume => "volume",
            StopAtKind::Weight => "weight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAtAction {
    Enabled,
    Disabled,
    Triggered,
    De1Controlled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAtNotification {
    pub stop_at: StopAtKind,
    pub action: StopAtAction,
    pub target_value: Option<f64>,
    pub current_value: Option<f64>,
    pub active_state: MachineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleTareSeen {
    pub scale_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTareAction {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTareNotification {
    pub action: AutoTareAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleButtonPress {
    pub button: u8,
}

/// Legacy connectivity view kept for existing UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Initial,
    Connecting,
    Connected,
    Ready,
    NotReady,
    Disconnecting,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityChange {
    pub state: ConnectivityState,
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAvailability {
    pub role: DeviceRole,
    pub state: crate::device::AvailabilityState,
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// A role handle adopted or dropped a specific device model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChanged {
    pub role: DeviceRole,
    pub id: Option<String>,
    pub previous_model: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleChange {
    pub id: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueDotUpdate {
    pub temperature: f64,
    pub high_alarm: Option<f64>,
    pub units: String,
}

/// One device seen during a scan, with the roles its advertised name
/// suggests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub address: String,
    pub name: Option<String>,
    pub role_candidates: Vec<DeviceRole>,
}

/// Kind-tagged payload union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Payload {
    StateUpdate(StateUpdate),
    #[serde(rename = "ShotSampleWithVolumesUpdate")]
    ShotSample(ShotSample),
    #[serde(rename = "WeightAndFlowUpdate")]
    WeightAndFlow(WeightAndFlow),
    #[serde(rename = "WaterLevelUpdate")]
    WaterLevel(WaterLevel),
    #[serde(rename = "SequencerGateNotification")]
    SequencerGate(SequencerGateNotification),
    #[serde(rename = "StopAtNotification")]
    StopAt(StopAtNotification),
    #[serde(rename = "ScaleTareSeen")]
    ScaleTare(ScaleTareSeen),
    #[serde(rename = "AutoTareNotification")]
    AutoTare(AutoTareNotification),
    #[serde(rename = "ScaleButtonPress")]
    ScaleButton(ScaleButtonPress),
    #[serde(rename = "ConnectivityChange")]
    Connectivity(ConnectivityChange),
    DeviceAvailability(DeviceAvailability),
    DeviceChanged(DeviceChanged),
    ScaleChange(ScaleChange),
    BlueDotUpdate(BlueDotUpdate),
    #[serde(rename = "ScannerNotification")]
    ScanReport(ScanReport),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::StateUpdate(_) => EventKind::StateUpdate,
            Payload::ShotSample(_) => EventKind::ShotSample,
            Payload::WeightAndFlow(_) => EventKind::WeightAndFlow,
            Payload::WaterLevel(_) => EventKind::WaterLevel,
            Payload::SequencerGate(_) => EventKind::SequencerGate,
            Payload::StopAt(_) => EventKind::StopAt,
            Payload::ScaleTare(_) => EventKind::ScaleTare,
            Payload::AutoTare(_) => EventKind::AutoTare,
            Payload::ScaleButton(_) => EventKind::ScaleButton,
            Payload::Connectivity(_) => EventKind::Connectivity,
            Payload::DeviceAvailability(_) => EventKind::DeviceAvailability,
            Payload::DeviceChanged(_) => EventKind::DeviceChanged,
            Payload::ScaleChange(_) => EventKind::ScaleChange,
            Payload::BlueDotUpdate(_) => EventKind::BlueDotUpdate,
            Payload::ScanReport(_) => EventKind::ScanReport,
        }
    }

    /// Semantic version of the payload's field set.
    pub fn version(&self) -> &'static str {
        match self {
            Payload::SequencerGate(_) => "1.1.0",
            _ => "1.0.0",
        }
    }
}

/// A published payload with its stamps and sender identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub sender: String,
    /// When the trigger occurred (wall clock).
    pub arrival_time: f64,
    /// When the payload object was created (wall clock).
    pub create_time: f64,
    /// Stamped by the bus at publish (monotonic).
    pub event_time: f64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
