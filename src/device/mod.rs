//! Managed Bluetooth device layer.
//!
//! A role-keyed handle stays stable while the physical device comes and
//! goes and possibly changes model underneath it.

mod de1;
mod intent;
mod managed;
mod registry;
mod scratch;
mod transport;

pub use de1::{De1, De1Link, FeatureFlags};
pub use intent::{CaptureRequest, IntentQueue, RequestAction};
pub use managed::{
    DeviceCommand, DeviceHandle, DeviceSupervisor, SharedDeviceState, SupervisorParts,
};
pub use registry::{DeviceModel, ModelRegistry};
pub use scratch::ScratchArea;
pub use transport::{BleTransport, De1Sample, DeviceReport, RecordingTransport, TransportEvent};

use serde::{Deserialize, Serialize};

/// One logical device per role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    De1,
    Scale,
    Thermometer,
    Other,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::De1 => "de1",
            DeviceRole::Scale => "scale",
            DeviceRole::Thermometer => "thermometer",
            DeviceRole::Other => "other",
        }
    }
}

/// Lifecycle snapshot derived from the intent queue, with the Ready
/// refinement layered on by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    Initial,
    Capturing,
    Captured,
    Ready,
    NotReady,
    Releasing,
    Released,
}
