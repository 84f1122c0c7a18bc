//! The core's view of everything: bus event handling, the API backend,
//! and the snapshot source for sequence rows.

use std::fs;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::{ApiBackend, MAPPING_VERSION, RESOURCE_VERSION, SetterResult};
use crate::config::Config;
use crate::device::{
    AvailabilityState, BleTransport, De1, DeviceHandle, DeviceReport, DeviceRole,
};
use crate::event::{
    BlueDotUpdate, Envelope, EventBus, Payload, ScaleButtonPress, StopAtKind, WaterLevel,
};
use crate::profile::{FrameProfile, ProfileRegistry};
use crate::recorder::{SequenceSnapshots, SnapshotSource};
use crate::scale::ScaleProcessor;
use crate::sequencer::{FlowSequencer, MachineState, ScaleLink, StateRequester};
use crate::{Error, Result};

pub struct Core {
    pub config: Config,
    pub bus: EventBus,
    pub de1: Arc<De1>,
    pub de1_handle: DeviceHandle,
    pub scale_handle: DeviceHandle,
    pub thermometer_handle: DeviceHandle,
    pub sequencer: FlowSequencer,
    pub scale_link: Arc<ScaleLink>,
    pub scale_processor: ScaleProcessor,
    pub profiles: ProfileRegistry,
    pub scanner: Box<dyn BleTransport>,
}

impl Core {
    /// One bus envelope through the sequencer and housekeeping.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        let now = env.arrival_time;
        match &env.payload {
            Payload::StateUpdate(su) => {
                self.sequencer.on_state_update(su, now);
                if su.state == MachineState::Sleep && su.previous_state != MachineState::Sleep {
                    // Let the peripherals sleep too.
                    if let Err(e) = self.scale_handle.release() {
                        tracing::warn!("scale release on sleep failed: {e}");
                    }
                    if let Err(e) = self.thermometer_handle.release() {
                        tracing::warn!("thermometer release on sleep failed: {e}");
                    }
                }
            }
            Payload::ShotSample(sample) => self.sequencer.on_shot_sample(sample, now),
            Payload::WeightAndFlow(wafu) => self.sequencer.on_weight_and_flow(wafu, now),
            Payload::DeviceAvailability(avail) => match avail.role {
                DeviceRole::Scale => {
                    self.scale_link
                        .set_ready(avail.state == AvailabilityState::Ready);
                    if avail.state == AvailabilityState::Released {
                        self.scale_processor.reset();
                    }
                }
                DeviceRole::De1 => {
                    if matches!(
                        avail.state,
                        AvailabilityState::Released | AvailabilityState::NotReady
                    ) {
                        self.sequencer.on_de1_disconnected(now);
                    }
                }
                _ => {}
            },
            Payload::ScaleChange(_) => self.scale_processor.reset(),
            _ => {}
        }
    }

    /// One decoded reading from a device adapter: update cached state
    /// and publish the typed payload.
    pub fn handle_report(&mut self, report: DeviceReport, now: f64) {
        match report {
            DeviceReport::De1State { state, substate } => {
                self.de1.update_state(state, substate, now);
            }
            DeviceReport::De1ShotSample(sample) => {
                self.de1.update_shot_sample(&sample, now);
            }
            DeviceReport::De1WaterLevel {
                level,
                start_fill_level,
            } => {
                self.de1.set_water_level(level);
                self.bus.publish(
                    "DE1",
                    now,
                    Payload::WaterLevel(WaterLevel {
                        level,
                        start_fill_level,
                    }),
                );
            }
            DeviceReport::ScaleWeight { scale_time, weight } => {
                self.scale_processor.on_weight_report(scale_time, weight, now);
            }
            DeviceReport::ScaleButton { button } => {
                self.bus.publish(
                    "Scale",
                    now,
                    Payload::ScaleButton(ScaleButtonPress { button }),
                );
            }
            DeviceReport::ThermometerReading {
                temperature,
                high_alarm,
                units,
            } => {
                self.bus.publish(
                    "BlueDOT",
                    now,
                    Payload::BlueDotUpdate(BlueDotUpdate {
                        temperature,
                        high_alarm,
                        units,
                    }),
                );
            }
        }
    }

    pub fn tick(&mut self, now: f64) {
        self.sequencer.on_tick(now);
    }

    fn handle_for(&self, role: DeviceRole) -> Result<&DeviceHandle> {
        match role {
            DeviceRole::De1 => Ok(&self.de1_handle),
            DeviceRole::Scale => Ok(&self.scale_handle),
            DeviceRole::Thermometer => Ok(&self.thermometer_handle),
            DeviceRole::Other => Err(Error::bad_request("no managed device for role 'other'")),
        }
    }

    fn upload_to_de1(&mut self, decoded: &FrameProfile, id: &str, results: &mut Vec<SetterResult>) {
        if !self.de1_handle.is_ready() {
            results.push(SetterResult::failed("upload", "DE1 is not connected"));
            return;
        }
        match self.de1.upload_program(decoded) {
            Ok(()) => {
                self.de1.set_latest_profile_id(Some(id.to_string()));
                results.push(SetterResult::ok("upload"));
            }
            Err(e) => {
                results.push(SetterResult::failed("upload", e));
                return;
            }
        }
        let can_override_tank = self
            .sequencer
            .control(MachineState::Espresso)
            .is_some_and(|c| c.profile_can_override_tank_temperature);
        if let Some(tank) = decoded.tank_temperature
            && can_override_tank
        {
            match self.de1.write_tank_threshold(tank) {
                Ok(()) => results.push(SetterResult::ok("tank_temperature")),
                Err(e) => results.push(SetterResult::failed("tank_temperature", e)),
            }
        }
    }
}

impl ApiBackend for Core {
    fn version(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mapping_version": MAPPING_VERSION,
            "resource_version": RESOURCE_VERSION,
        })
    }

    fn de1_state(&self) -> Result<Value> {
        let (state, substate) = self.de1.current_state();
        Ok(json!({"state": state, "substate": substate}))
    }

    fn de1_feature_flags(&self) -> Result<Value> {
        serde_json::to_value(self.de1.feature_flags())
            .map_err(|e| Error::fatal(format!("feature flags render: {e}")))
    }

    fn request_mode(&mut self, mode: MachineState) -> Result<()> {
        let flags = self.de1.feature_flags();
        if mode.is_flow_state() && flags.ghc_active {
            return Err(Error::UnsupportedFeature {
                reason: "group head controller present; flow starts only at the machine".into(),
            });
        }
        let (current, _) = self.de1.current_state();
        if mode.is_flow_state() && !matches!(current, MachineState::Idle) {
            return Err(Error::UnsupportedStateTransition {
                reason: format!("cannot start {} from {}", mode.name(), current.name()),
            });
        }
        if !self.de1_handle.is_ready() {
            return Err(Error::DeviceNotConnected {
                role: DeviceRole::De1,
            });
        }
        self.de1.request_state(mode);
        Ok(())
    }

    fn patch_availability(&mut self, role: DeviceRole, body: &Value) -> Result<Vec<SetterResult>> {
        let Some(entries) = body.as_object() else {
            return Err(Error::bad_request("availability patch must be an object"));
        };
        let handle = self.handle_for(role)?.clone();
        let mut results = Vec::new();
        for (key, value) in entries {
            let result = match key.as_str() {
                "assign_address" => match value {
                    Value::String(addr) => handle.assign_address(Some(addr.clone())),
                    Value::Null => handle.assign_address(None),
                    _ => Err(Error::bad_request("assign_address must be string or null")),
                },
                "forget" => handle.assign_address(None),
                "capture" => handle.capture(),
                "release" => handle.release(),
                other => Err(Error::bad_request(format!(
                    "unrecognized availability key '{other}'"
                ))),
            };
            results.push(match result {
                Ok(()) => SetterResult::ok(key),
                Err(e) => SetterResult::failed(key, e.to_string()),
            });
        }
        Ok(results)
    }

    fn begin_scan(&mut self, body: &Value) -> Result<Vec<SetterResult>> {
        let seconds = match body.get("begin") {
            None | Some(Value::Null) => self.config.bluetooth.scan_time,
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| Error::bad_request("begin must be a number or null"))?,
            Some(_) => return Err(Error::bad_request("begin must be a number or null")),
        };
        self.scanner.begin_scan(seconds);
        Ok(vec![SetterResult::ok("begin")])
    }

    fn get_control(&self, mode: MachineState) -> Result<Value> {
        let control = self
            .sequencer
            .control(mode)
            .ok_or_else(|| Error::bad_request(format!("{} has no control record", mode.name())))?;
        Ok(json!({
            "disable_auto_tare": control.disable_auto_tare,
            "stop_at_time": control.stop_at(StopAtKind::Time),
            "stop_at_time_managed_by_de1": control.time_managed_by_de1(),
            "stop_at_volume": control.stop_at(StopAtKind::Volume),
            "stop_at_weight": control.stop_at(StopAtKind::Weight),
            "first_drops_threshold": control.first_drops_threshold,
            "last_drops_minimum_time": control.last_drops_minimum_time,
            "profile_can_override_stop_limits": control.profile_can_override_stop_limits,
            "profile_can_override_tank_temperature": control.profile_can_override_tank_temperature,
        }))
    }

    fn patch_control(&mut self, mode: MachineState, body: &Value) -> Result<Vec<SetterResult>> {
        let Some(entries) = body.as_object() else {
            return Err(Error::bad_request("control patch must be an object"));
        };
        let control = self
            .sequencer
            .control_mut(mode)
            .ok_or_else(|| Error::bad_request(format!("{} has no control record", mode.name())))?;
        let mut results = Vec::new();
        for (key, value) in entries {
            let outcome = match key.as_str() {
                "disable_auto_tare" => match value.as_bool() {
                    Some(v) => {
                        control.disable_auto_tare = v;
                        Ok(())
                    }
                    None => Err(Error::bad_request("disable_auto_tare must be a bool")),
                },
                "stop_at_time" => set_stop_at(control, StopAtKind::Time, value),
                "stop_at_volume" => set_stop_at(control, StopAtKind::Volume, value),
                "stop_at_weight" => set_stop_at(control, StopAtKind::Weight, value),
                "first_drops_threshold" => {
                    optional_f64(value).and_then(|v| control.set_first_drops_threshold(v))
                }
                "last_drops_minimum_time" => {
                    optional_f64(value).and_then(|v| control.set_last_drops_minimum_time(v))
                }
                "profile_can_override_stop_limits" => match value.as_bool() {
                    Some(v) => {
                        control.profile_can_override_stop_limits = v;
                        Ok(())
                    }
                    None => Err(Error::bad_request(
                        "profile_can_override_stop_limits must be a bool",
                    )),
                },
                "profile_can_override_tank_temperature" => match value.as_bool() {
                    Some(v) => {
                        control.profile_can_override_tank_temperature = v;
                        Ok(())
                    }
                    None => Err(Error::bad_request(
                        "profile_can_override_tank_temperature must be a bool",
                    )),
                },
                other => Err(Error::bad_request(format!(
                    "unrecognized control key '{other}'"
                ))),
            };
            results.push(match outcome {
                Ok(()) => SetterResult::ok(key),
                Err(e) => SetterResult::failed(key, e.to_string()),
            });
        }
        Ok(results)
    }

    fn put_profile(&mut self, source: &[u8]) -> Result<Vec<SetterResult>> {
        let now = self.bus.clock().wall();
        let outcome = self.profiles.insert(source, now)?;
        self.sequencer.apply_profile(&outcome.decoded);
        let mut results = vec![SetterResult::ok("profile")];
        let id = outcome.profile.id.clone();
        self.upload_to_de1(&outcome.decoded, &id, &mut results);
        Ok(results)
    }

    fn put_profile_by_id(&mut self, id: &str) -> Result<Vec<SetterResult>> {
        let now = self.bus.clock().wall();
        let profile = self.profiles.get(id)?;
        let decoded = FrameProfile::parse(&profile.source)?;
        self.profiles.touch_last_uploaded(id, now)?;
        self.sequencer.apply_profile(&decoded);
        let mut results = vec![SetterResult::ok("profile_id")];
        self.upload_to_de1(&decoded, id, &mut results);
        Ok(results)
    }

    fn list_logs(&self) -> Result<Value> {
        let dir = &self.config.logging.log_directory;
        let mut names = Vec::new();
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        names.sort();
        Ok(json!(names))
    }

    fn get_log(&self, id: &str) -> Result<Value> {
        if id.contains('/') || id.contains("..") {
            return Err(Error::bad_request(format!("bad log name '{id}'")));
        }
        let path = self.config.logging.log_directory.join(id);
        let contents = fs::read_to_string(&path)
            .map_err(|_| Error::bad_request(format!("no log '{id}'")))?;
        Ok(Value::String(contents))
    }
}

fn set_stop_at(
    control: &mut crate::sequencer::ModeControl,
    kind: StopAtKind,
    value: &Value,
) -> Result<()> {
    optional_f64(value).and_then(|v| control.set_stop_at(kind, v))
}

fn optional_f64(value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::bad_request("expected a number or null")),
        _ => Err(Error::bad_request("expected a number or null")),
    }
}

/// Snapshot provider handed to the recorder thread; reads only cached
/// state.
#[derive(Clone)]
pub struct CoreSnapshots {
    pub de1: Arc<De1>,
    pub de1_handle: DeviceHandle,
    pub scale_handle: DeviceHandle,
}

impl SnapshotSource for CoreSnapshots {
    fn snapshots(&self) -> SequenceSnapshots {
        let cached = self.de1.snapshot_json();
        let de1 = self.de1_handle.snapshot();
        let scale = self.scale_handle.snapshot();
        SequenceSnapshots {
            resource_version: json!({
                "version": env!("CARGO_PKG_VERSION"),
                "mapping_version": MAPPING_VERSION,
                "resource_version": RESOURCE_VERSION,
            })
            .to_string(),
            de1_id: json!({"address": de1.address, "name": de1.name}).to_string(),
            de1_read_once: cached.to_string(),
            de1_calibration_flow_multiplier: json!({"multiplier": 1.0}).to_string(),
            de1_control_mode: cached["state"].to_string(),
            de1_control_tank_water_threshold: cached["water_level"].to_string(),
            de1_setting_before_flow: json!({
                "stop_lead_time": cached["stop_lead_time"],
                "fall_time": cached["fall_time"],
            })
            .to_string(),
            de1_setting_steam: json!({}).to_string(),
            de1_setting_target_group_temp: json!({}).to_string(),
            scale_id: json!({
                "address": scale.address,
                "model": scale.model.as_str(),
            })
            .to_string(),
        }
    }

    fn latest_profile_id(&self) -> Option<String> {
        self.de1.latest_profile_id()
    }

    fn active_state_name(&self) -> String {
        self.de1.current_state().0.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BluetoothConfig;
    use crate::device::{
        De1Link, De1Sample, DeviceSupervisor, RecordingTransport,
    };
    use crate::event::{EventKind, ManualClock};
    use crate::profile::FrameProfile;
    use crate::recorder::{HistoryStore, into_shared};
    use crate::scale::{ScaleProcessor, TareSink};
    use crate::sequencer::Substate;

    struct NullLink;

    impl De1Link for NullLink {
        fn request_state(&self, _state: MachineState) -> std::result::Result<(), String> {
            Ok(())
        }

        fn upload_program(&self, _profile: &FrameProfile) -> std::result::Result<(), String> {
            Ok(())
        }

        fn write_tank_threshold(&self, _celsius: f64) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    struct NullTare;

    impl TareSink for NullTare {
        fn tare(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn handle_for_tests(role: DeviceRole, bus: &EventBus, dir: &std::path::Path) -> DeviceHandle {
        let transport = RecordingTransport::new();
        let events_rx = transport.events_rx.clone();
        let cfg = BluetoothConfig {
            id_file_directory: dir.to_path_buf(),
            ..BluetoothConfig::default()
        };
        DeviceSupervisor::new(role, bus.clone(), Box::new(transport), events_rx, cfg).handle
    }

    fn core() -> (Core, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let de1 = Arc::new(De1::new(bus.clone(), Arc::new(NullLink)));
        let scale_link = Arc::new(crate::sequencer::ScaleLink::new());
        let requester: Arc<dyn StateRequester> = de1.clone() as Arc<dyn StateRequester>;
        let sequencer = FlowSequencer::new(bus.clone(), requester, Arc::clone(&scale_link));
        let scale_processor =
            ScaleProcessor::new(bus.clone(), Arc::clone(&scale_link), Arc::new(NullTare));
        let store = into_shared(
            HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap(),
        );
        let core = Core {
            config: Config::default(),
            bus: bus.clone(),
            de1,
            de1_handle: handle_for_tests(DeviceRole::De1, &bus, dir.path()),
            scale_handle: handle_for_tests(DeviceRole::Scale, &bus, dir.path()),
            thermometer_handle: handle_for_tests(DeviceRole::Thermometer, &bus, dir.path()),
            sequencer,
            scale_link,
            scale_processor,
            profiles: crate::profile::ProfileRegistry::new(store),
            scanner: Box::new(RecordingTransport::new()),
        };
        (core, bus, dir)
    }

    #[test]
    fn reports_reach_the_bus_as_typed_payloads() {
        let (mut core, bus, _dir) = core();
        let sub = bus.subscribe(
            "t",
            Some(&[
                EventKind::StateUpdate,
                EventKind::ShotSample,
                EventKind::WeightAndFlow,
                EventKind::WaterLevel,
            ]),
        );

        core.handle_report(
            DeviceReport::De1State {
                state: MachineState::Espresso,
                substate: Substate::PreInfuse,
            },
            1.0,
        );
        core.handle_report(
            DeviceReport::De1ShotSample(De1Sample {
                sample_time: 10.0,
                group_pressure: 8.5,
                group_flow: 2.0,
                mix_temp: 92.0,
                head_temp: 92.0,
                frame_number: 1,
            }),
            1.1,
        );
        core.handle_report(
            DeviceReport::ScaleWeight {
                scale_time: 10.0,
                weight: 12.5,
            },
            1.2,
        );
        core.handle_report(
            DeviceReport::De1WaterLevel {
                level: 20.0,
                start_fill_level: 5.0,
            },
            1.3,
        );

        let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.try_recv())
            .map(|env| env.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StateUpdate,
                EventKind::ShotSample,
                EventKind::WeightAndFlow,
                EventKind::WaterLevel,
            ]
        );
    }
}
