//! Cached DE1 state and the control path back to the machine.
//!
//! The concrete characteristic encoding lives behind `De1Link`; this
//! module owns what the rest of the daemon needs to know about the
//! machine between notifications.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::transport::De1Sample;
use crate::event::{EventBus, Payload, ShotSample, StateUpdate};
use crate::profile::FrameProfile;
use crate::sequencer::{MachineState, StateRequester, Substate};

/// Firmware 1283 moved flush timing into the machine itself.
const RINSE_CONTROL_MIN_FIRMWARE: u32 = 1283;

/// Writes to the machine. Implemented by the platform BLE adapter; a
/// recording stub stands in under test.
pub trait De1Link: Send + Sync {
    fn request_state(&self, state: MachineState) -> Result<(), String>;
    fn upload_program(&self, profile: &FrameProfile) -> Result<(), String>;
    fn write_tank_threshold(&self, celsius: f64) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub ghc_active: bool,
    pub rinse_control: bool,
    pub firmware_version: u32,
}

impl FeatureFlags {
    pub fn for_firmware(firmware_version: u32, ghc_active: bool) -> Self {
        Self {
            ghc_active,
            rinse_control: firmware_version >= RINSE_CONTROL_MIN_FIRMWARE,
            firmware_version,
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            ghc_active: false,
            rinse_control: false,
            firmware_version: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct De1State {
    state: MachineState,
    substate: Substate,
    features: FeatureFlags,
    latest_profile_id: Option<String>,
    /// DE1-reported stop latency and basket-to-cup fall time, seconds.
    stop_lead_time: f64,
    fall_time: f64,
    water_level: Option<f64>,
    /// Dispensed-volume accumulation across the current flow.
    last_sample_time: Option<f64>,
    volume_preinfuse: f64,
    volume_pour: f64,
}

/// The DE1 as the rest of the daemon sees it: cached state plus the
/// write path. Lifecycle is the managed-device layer's job, not ours.
pub struct De1 {
    bus: EventBus,
    link: Arc<dyn De1Link>,
    state: Mutex<De1State>,
}

impl De1 {
    pub fn new(bus: EventBus, link: Arc<dyn De1Link>) -> Self {
        Self {
            bus,
            link,
            state: Mutex::new(De1State {
                state: MachineState::Sleep,
                substate: Substate::NoState,
                features: FeatureFlags::default(),
                latest_profile_id: None,
                stop_lead_time: 0.0,
                fall_time: 0.17,
                water_level: None,
                last_sample_time: None,
                volume_preinfuse: 0.0,
                volume_pour: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, De1State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decoded state notification from the adapter: update the cache and
    /// publish the transition.
    pub fn update_state(&self, state: MachineState, substate: Substate, arrival_time: f64) {
        let (previous_state, previous_substate) = {
            let mut cached = self.lock();
            let prev = (cached.state, cached.substate);
            cached.state = state;
            cached.substate = substate;
            if state.is_flow_state() && !prev.0.is_flow_state() {
                // A fresh flow starts its volume count from zero.
                cached.last_sample_time = None;
                cached.volume_preinfuse = 0.0;
                cached.volume_pour = 0.0;
            }
            prev
        };
        if (previous_state, previous_substate) == (state, substate) {
            return;
        }
        self.bus.publish(
            "DE1",
            arrival_time,
            Payload::StateUpdate(StateUpdate {
                state,
                substate,
                previous_state,
                previous_substate,
            }),
        );
    }

    /// Decoded shot sample from the adapter: fold the flow into the
    /// dispensed volumes and publish the sample with them attached.
    pub fn update_shot_sample(&self, sample: &De1Sample, arrival_time: f64) {
        let with_volumes = {
            let mut cached = self.lock();
            if cached.state.is_flow_state()
                && let Some(previous) = cached.last_sample_time
            {
                let dv = sample.group_flow.max(0.0) * (sample.sample_time - previous).max(0.0);
                if cached.substate == Substate::PreInfuse {
                    cached.volume_preinfuse += dv;
                } else if cached.substate.during_flow() {
                    cached.volume_pour += dv;
                }
            }
            cached.last_sample_time = Some(sample.sample_time);
            ShotSample {
                de1_time: sample.sample_time,
                group_pressure: sample.group_pressure,
                group_flow: sample.group_flow,
                mix_temp: sample.mix_temp,
                head_temp: sample.head_temp,
                frame_number: sample.frame_number,
                volume_preinfuse: cached.volume_preinfuse,
                volume_pour: cached.volume_pour,
                volume_total: cached.volume_preinfuse + cached.volume_pour,
            }
        };
        self.bus
            .publish("DE1", arrival_time, Payload::ShotSample(with_volumes));
    }

    pub fn current_state(&self) -> (MachineState, Substate) {
        let cached = self.lock();
        (cached.state, cached.substate)
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        self.lock().features
    }

    pub fn set_feature_flags(&self, features: FeatureFlags) {
        self.lock().features = features;
    }

    pub fn latest_profile_id(&self) -> Option<String> {
        self.lock().latest_profile_id.clone()
    }

    pub fn set_latest_profile_id(&self, id: Option<String>) {
        self.lock().latest_profile_id = id;
    }

    pub fn stop_lead_and_fall_time(&self) -> (f64, f64) {
        let cached = self.lock();
        (cached.stop_lead_time, cached.fall_time)
    }

    pub fn set_water_level(&self, level: f64) {
        self.lock().water_level = Some(level);
    }

    pub fn upload_program(&self, profile: &FrameProfile) -> Result<(), String> {
        self.link.upload_program(profile)
    }

    pub fn write_tank_threshold(&self, celsius: f64) -> Result<(), String> {
        self.link.write_tank_threshold(celsius)
    }

    /// JSON snapshot of cached machine state for the sequence record.
    /// Never reads the wire.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let cached = self.lock();
        serde_json::json!({
            "state": cached.state.name(),
            "firmware_version": cached.features.firmware_version,
            "ghc_active": cached.features.ghc_active,
            "rinse_control": cached.features.rinse_control,
            "stop_lead_time": cached.stop_lead_time,
            "fall_time": cached.fall_time,
            "water_level": cached.water_level,
        })
    }
}

impl StateRequester for De1 {
    fn request_state(&self, state: MachineState) {
        if let Err(e) = self.link.request_state(state) {
            tracing::error!("state request {} failed: {e}", state.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ManualClock};

    struct NullLink;

    impl De1Link for NullLink {
        fn request_state(&self, _state: MachineState) -> Result<(), String> {
            Ok(())
        }

        fn upload_program(&self, _profile: &FrameProfile) -> Result<(), String> {
            Ok(())
        }

        fn write_tank_threshold(&self, _celsius: f64) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn state_updates_carry_previous() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let sub = bus.subscribe("t", Some(&[EventKind::StateUpdate]));
        let de1 = De1::new(bus.clone(), Arc::new(NullLink));

        de1.update_state(MachineState::Idle, Substate::NoState, 1.0);
        de1.update_state(MachineState::Espresso, Substate::PreInfuse, 2.0);

        let first = sub.try_recv().unwrap();
        let Payload::StateUpdate(su) = first.payload else {
            panic!("wrong payload");
        };
        assert_eq!(su.previous_state, MachineState::Sleep);
        assert_eq!(su.state, MachineState::Idle);

        let second = sub.try_recv().unwrap();
        let Payload::StateUpdate(su) = second.payload else {
            panic!("wrong payload");
        };
        assert_eq!(su.previous_state, MachineState::Idle);
        assert_eq!(su.state, MachineState::Espresso);
    }

    #[test]
    fn duplicate_state_is_not_republished() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let sub = bus.subscribe("t", Some(&[EventKind::StateUpdate]));
        let de1 = De1::new(bus.clone(), Arc::new(NullLink));
        de1.update_state(MachineState::Idle, Substate::NoState, 1.0);
        sub.try_recv().unwrap();
        de1.update_state(MachineState::Idle, Substate::NoState, 1.1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn rinse_control_tracks_firmware() {
        assert!(!FeatureFlags::for_firmware(1282, false).rinse_control);
        assert!(FeatureFlags::for_firmware(1283, false).rinse_control);
    }

    fn sample(t: f64, flow: f64) -> De1Sample {
        De1Sample {
            sample_time: t,
            group_pressure: 8.0,
            group_flow: flow,
            mix_temp: 92.0,
            head_temp: 92.0,
            frame_number: 1,
        }
    }

    #[test]
    fn shot_samples_accumulate_volumes_by_phase() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let sub = bus.subscribe("t", Some(&[EventKind::ShotSample]));
        let de1 = De1::new(bus.clone(), Arc::new(NullLink));

        de1.update_state(MachineState::Espresso, Substate::PreInfuse, 0.0);
        de1.update_shot_sample(&sample(10.0, 1.0), 0.0);
        de1.update_shot_sample(&sample(10.5, 1.0), 0.5);
        de1.update_state(MachineState::Espresso, Substate::Pour, 0.6);
        de1.update_shot_sample(&sample(11.0, 2.0), 1.0);

        let mut last = None;
        while let Some(env) = sub.try_recv() {
            if let Payload::ShotSample(s) = env.payload {
                last = Some(s);
            }
        }
        let s = last.unwrap();
        // 0.5 s of 1.0 mL/s preinfuse, then 0.5 s of 2.0 mL/s pour.
        assert!((s.volume_preinfuse - 0.5).abs() < 1e-9);
        assert!((s.volume_pour - 1.0).abs() < 1e-9);
        assert!((s.volume_total - 1.5).abs() < 1e-9);

        // A new flow starts the count over.
        de1.update_state(MachineState::Idle, Substate::NoState, 2.0);
        de1.update_state(MachineState::Espresso, Substate::PreInfuse, 3.0);
        de1.update_shot_sample(&sample(20.0, 1.0), 3.1);
        let env = sub.try_recv().unwrap();
        let Payload::ShotSample(s) = env.payload else {
            panic!("wrong payload");
        };
        assert_eq!(s.volume_total, 0.0);
    }
}
