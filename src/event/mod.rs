//! In-process publish/subscribe over typed event payloads.

mod bus;
mod payload;

pub use bus::{EventBus, Subscription};
pub use payload::{
    ALL_GATES, AutoTareAction, AutoTareNotification, BlueDotUpdate, CloseReason,
    ConnectivityChange, ConnectivityState, DeviceAvailability, DeviceChanged, Envelope, EventKind,
    GateAction, GateName, Payload, ScaleButtonPress, ScaleChange, ScaleTareSeen,
    ScanReport, SequencerGateNotification, ShotSample, StateUpdate, StopAtAction, StopAtKind,
    StopAtNotification, WaterLevel, WeightAndFlow,
};

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock and monotonic time, in seconds, as `f64`.
///
/// All event stamps and store columns use this representation. The trait
/// exists so sequencer and recorder logic can be driven with fabricated
/// times under test.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn wall(&self) -> f64;
    /// Seconds from an arbitrary fixed origin, monotonic.
    fn monotonic(&self) -> f64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock, for deterministic tests.
pub struct ManualClock {
    now: std::sync::Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += seconds;
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monotonic(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
