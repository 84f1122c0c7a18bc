//! FlowSequencer: drives the shot lifecycle off DE1 state transitions
//! and sensor samples.
//!
//! The sequencer is a pure observer when the DE1 carries a group-head
//! controller; its own outputs are gate events, stop-at and auto-tare
//! notifications, and at most one stop request per trigger.

mod gate;
mod machine;
mod mode;

pub use gate::{GateSet, GateState};
pub use machine::{FlowPhase, MachineState, Substate};
pub use mode::{
    FIRST_DROPS_THRESHOLD_DEFAULT, LAST_DROPS_MINIMUM_TIME_DEFAULT, ModeControl,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::event::{
    ALL_GATES, AutoTareAction, AutoTareNotification, CloseReason, EventBus, GateAction, GateName,
    Payload, SequencerGateNotification, ShotSample, StateUpdate, StopAtAction, StopAtKind,
    StopAtNotification, WeightAndFlow,
};
use crate::profile::FrameProfile;

const SENDER: &str = "FlowSequencer";

/// Outbound control channel to the DE1; the sequencer only ever asks for
/// a state, it never writes characteristics itself.
pub trait StateRequester: Send + Sync {
    fn request_state(&self, state: MachineState);
}

/// Contact point between the sequencer and the scale processor.
///
/// The sequencer flips `hold_at_tare`; the processor does the taring.
pub struct ScaleLink {
    hold_at_tare: AtomicBool,
    ready: AtomicBool,
}

impl ScaleLink {
    pub fn new() -> Self {
        Self {
            hold_at_tare: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_hold_at_tare(&self, hold: bool) {
        self.hold_at_tare.store(hold, Ordering::Release);
    }

    pub fn hold_at_tare(&self) -> bool {
        self.hold_at_tare.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl Default for ScaleLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Tunables the sequencer reads from configuration and from cached DE1
/// state.
#[derive(Debug, Clone)]
pub struct SequencerSettings {
    /// Seconds; larger leaves more weight in the cup.
    pub stop_at_weight_adjust: f64,
    pub sequence_watchdog_timeout: f64,
    /// DE1-reported latency between a stop request and flow actually
    /// stopping.
    pub stop_lead_time: f64,
    /// DE1-reported time for in-flight liquid to fall from basket to cup.
    pub fall_time: f64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            stop_at_weight_adjust: -0.07,
            sequence_watchdog_timeout: 270.0,
            stop_lead_time: 0.0,
            fall_time: 0.0,
        }
    }
}

struct ActiveSequence {
    id: String,
    state: MachineState,
    start_time: f64,
    flow_begin_time: Option<f64>,
    gates: GateSet,
    sat_active: bool,
    sav_active: bool,
    saw_active: bool,
    sat_triggered: bool,
    sav_triggered: bool,
    saw_triggered: bool,
    /// SAW silently disabled for this sequence (no scale was ready).
    saw_unavailable: bool,
    sat_deadline: Option<f64>,
    last_drops_deadline: Option<f64>,
    watchdog_deadline: f64,
    complete: bool,
}

pub struct FlowSequencer {
    bus: EventBus,
    de1: Arc<dyn StateRequester>,
    scale: Arc<ScaleLink>,
    settings: SequencerSettings,
    controls: BTreeMap<MachineState, ModeControl>,
    active: Option<ActiveSequence>,
    last_sequence_id: String,
}

impl FlowSequencer {
    pub fn new(bus: EventBus, de1: Arc<dyn StateRequester>, scale: Arc<ScaleLink>) -> Self {
        Self::with_settings(bus, de1, scale, SequencerSettings::default())
    }

    pub fn with_settings(
        bus: EventBus,
        de1: Arc<dyn StateRequester>,
        scale: Arc<ScaleLink>,
        settings: SequencerSettings,
    ) -> Self {
        let mut controls = BTreeMap::new();
        controls.insert(MachineState::Espresso, ModeControl::espresso());
        controls.insert(MachineState::Steam, ModeControl::steam());
        controls.insert(MachineState::HotWater, ModeControl::hot_water());
        controls.insert(MachineState::HotWaterRinse, ModeControl::hot_water_rinse());
        Self {
            bus,
            de1,
            scale,
            settings,
            controls,
            active: None,
            last_sequence_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn control(&self, state: MachineState) -> Option<&ModeControl> {
        self.controls.get(&state)
    }

    pub fn control_mut(&mut self, state: MachineState) -> Option<&mut ModeControl> {
        self.controls.get_mut(&state)
    }

    pub fn settings_mut(&mut self) -> &mut SequencerSettings {
        &mut self.settings
    }

    pub fn active_state(&self) -> Option<MachineState> {
        self.active.as_ref().map(|a| a.state)
    }

    /// Id of the in-flight sequence, or of the last one if none is open.
    pub fn sequence_id(&self) -> &str {
        self.active
            .as_ref()
            .map(|a| a.id.as_str())
            .unwrap_or(&self.last_sequence_id)
    }

    pub fn sequence_start_time(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.start_time)
    }

    /// Limits from a freshly uploaded profile replace the Espresso
    /// limits for ensuing sequences, when the mode permits it.
    pub fn apply_profile(&mut self, profile: &FrameProfile) {
        let Some(control) = self.controls.get_mut(&MachineState::Espresso) else {
            return;
        };
        if control.profile_can_override_stop_limits {
            if let Some(target) = profile.target_volume {
                let value = (target > 0.0).then_some(target);
                if control.set_stop_at(StopAtKind::Volume, value).is_ok() {
                    tracing::info!("profile set stop-at-volume to {value:?}");
                }
            }
            if let Some(target) = profile.target_weight {
                let value = (target > 0.0).then_some(target);
                if control.set_stop_at(StopAtKind::Weight, value).is_ok() {
                    tracing::info!("profile set stop-at-weight to {value:?}");
                }
            }
        }
    }

    // === Event handlers, driven from the daemon's core loop ===

    pub fn on_state_update(&mut self, su: &StateUpdate, now: f64) {
        if su.state.is_flow_state() {
            if !su.previous_state.is_flow_state() {
                self.start_sequence(su.state, now);
                tracing::info!("start sequence for {}", su.state.name());
            }

            if su.substate.during_flow() && !su.previous_substate.during_flow() {
                self.set_gate(GateName::FlowBegin, now, None);
            }

            if su.previous_substate == Substate::PreInfuse && su.substate != Substate::PreInfuse {
                self.set_gate(GateName::ExitPreinfuse, now, None);
            }

            if su.previous_substate.during_flow() && !su.substate.during_flow() {
                self.set_gate(GateName::FlowEnd, now, None);
            }
        } else if su.previous_state.is_flow_state() {
            if su.previous_substate == Substate::PreInfuse {
                self.set_gate(GateName::ExitPreinfuse, now, None);
            }
            if su.previous_substate.during_flow() {
                self.set_gate(GateName::FlowEnd, now, None);
            }
            self.set_gate(GateName::FlowStateExit, now, None);
        }
    }

    pub fn on_shot_sample(&mut self, sample: &ShotSample, now: f64) {
        let Some(active) = &self.active else {
            return;
        };

        // First drops: flow at the group crossed the mode's threshold.
        // The substate report can lag the first sample, so this also
        // latches FlowBegin if the transition has not done so yet.
        if !active.gates.is_set(GateName::ExpectDrops)
            && let Some(threshold) = self
                .controls
                .get(&active.state)
                .and_then(|c| c.first_drops_threshold)
            && sample.group_flow >= threshold
        {
            self.set_gate(GateName::FlowBegin, now, None);
            self.set_gate(GateName::ExpectDrops, now, None);
        }

        self.check_stop_at_volume(sample.volume_pour, now);
        self.check_stop_at_time(now);
    }

    pub fn on_weight_and_flow(&mut self, wafu: &WeightAndFlow, now: f64) {
        let Some(active) = &mut self.active else {
            return;
        };
        if !active.saw_active || active.saw_triggered {
            return;
        }
        let Some(target) = self
            .controls
            .get(&active.state)
            .and_then(|c| c.stop_at(StopAtKind::Weight))
        else {
            return;
        };

        // Account for liquid still in the air between basket and cup.
        let lead = self.settings.stop_lead_time + self.settings.fall_time
            - self.settings.stop_at_weight_adjust;
        let comparison = target - wafu.average_flow.max(0.0) * lead;
        if wafu.current_weight >= comparison {
            active.saw_triggered = true;
            self.de1.request_state(MachineState::Idle);
            tracing::info!(
                "stop-at-weight triggered at {:.1} g for {:.1} g target",
                wafu.current_weight,
                target
            );
            self.notify_stop_at(
                StopAtKind::Weight,
                StopAtAction::Triggered,
                Some(wafu.current_weight),
                now,
            );
        }
    }

    /// Deadline checks: last-drops, stop-at-time, and the sequence
    /// watchdog. Driven by the core loop's periodic tick.
    pub fn on_tick(&mut self, now: f64) {
        self.check_stop_at_time(now);

        let Some(active) = &mut self.active else {
            return;
        };

        if let Some(deadline) = active.last_drops_deadline
            && now >= deadline
        {
            active.last_drops_deadline = None;
            self.set_gate(GateName::LastDrops, now, None);
        }

        let Some(active) = &self.active else {
            return;
        };
        if !active.complete && now >= active.watchdog_deadline {
            tracing::warn!(
                sequence_id = active.id.as_str(),
                "sequence watchdog expired, forcing close"
            );
            self.de1.request_state(MachineState::Idle);
            self.close_sequence(now, Some(CloseReason::Watchdog));
        }
    }

    /// The DE1 dropped mid-sequence: close cleanly, attribute the close.
    pub fn on_de1_disconnected(&mut self, now: f64) {
        if self.active.as_ref().is_some_and(|a| !a.complete) {
            self.close_sequence(now, Some(CloseReason::DeviceLost));
        }
    }

    /// Ordered-drain path: abort any open sequence before shutdown.
    pub fn abort_for_shutdown(&mut self, now: f64) {
        if self.active.as_ref().is_some_and(|a| !a.complete) {
            self.close_sequence(now, Some(CloseReason::Shutdown));
        }
    }

    // === Internals ===

    fn start_sequence(&mut self, state: MachineState, now: f64) {
        if self.active.as_ref().is_some_and(|a| !a.complete) {
            // An aborted shot rolled straight into another one.
            self.close_sequence(now, None);
        }

        let id = Uuid::new_v4().to_string();
        tracing::info!("starting {}, sequence_id {id}", state.name());

        let control = self.controls.get(&state).cloned();
        let watchdog_deadline = now + self.settings.sequence_watchdog_timeout;
        let mut active = ActiveSequence {
            id: id.clone(),
            state,
            start_time: now,
            flow_begin_time: None,
            gates: GateSet::new(),
            sat_active: false,
            sav_active: false,
            saw_active: false,
            sat_triggered: false,
            sav_triggered: false,
            saw_triggered: false,
            saw_unavailable: false,
            sat_deadline: None,
            last_drops_deadline: None,
            watchdog_deadline,
            complete: false,
        };

        // A SAW limit with no scale present is silently dropped for this
        // sequence; everything else proceeds.
        if let Some(c) = &control
            && c.stop_at(StopAtKind::Weight).is_some()
            && !self.scale.is_ready()
        {
            active.saw_unavailable = true;
            tracing::warn!("stop-at-weight configured but no scale is ready; disabled");
        }

        self.active = Some(active);
        self.last_sequence_id = id;

        for gate in ALL_GATES {
            self.publish_gate(gate, GateAction::Clear, None, now);
            if let Some(a) = &mut self.active {
                a.gates.clear(gate);
            }
        }
        self.set_gate(GateName::SequenceStart, now, None);

        // Auto-tare and initial stop-at notifications.
        let disable_auto_tare = control.as_ref().is_none_or(|c| c.disable_auto_tare);
        if !disable_auto_tare && self.scale.is_ready() {
            self.scale.set_hold_at_tare(true);
            self.notify_auto_tare(AutoTareAction::Enabled, now);
        } else {
            self.scale.set_hold_at_tare(false);
            self.notify_auto_tare(AutoTareAction::Disabled, now);
        }

        if let Some(c) = &control {
            if c.time_managed_by_de1() {
                self.notify_stop_at(StopAtKind::Time, StopAtAction::De1Controlled, None, now);
            } else {
                self.notify_stop_at(StopAtKind::Time, StopAtAction::Disabled, None, now);
            }
            self.notify_stop_at(StopAtKind::Volume, StopAtAction::Disabled, None, now);
            self.notify_stop_at(StopAtKind::Weight, StopAtAction::Disabled, None, now);
        }
    }

    fn set_gate(&mut self, gate: GateName, now: f64, reason: Option<CloseReason>) {
        let Some(active) = &mut self.active else {
            return;
        };
        if !active.gates.set(gate) {
            return;
        }
        self.publish_gate(gate, GateAction::Set, reason, now);
        tracing::info!("gate: {:?}", gate);
        self.after_gate_set(gate, now);
    }

    fn after_gate_set(&mut self, gate: GateName, now: f64) {
        match gate {
            GateName::FlowBegin => {
                if let Some(a) = &mut self.active {
                    a.flow_begin_time = Some(now);
                }
                self.arm_stop_at_time(now);
            }
            GateName::ExitPreinfuse => self.arm_stop_at_volume(now),
            GateName::ExpectDrops => {
                // Scale is released from tare hold once drops are due.
                if self.scale.hold_at_tare() {
                    self.scale.set_hold_at_tare(false);
                    self.notify_auto_tare(AutoTareAction::Disabled, now);
                }
                self.arm_stop_at_weight(now);
            }
            GateName::FlowEnd => {
                self.disarm_stop_ats(now);
                let ldmt = self
                    .active
                    .as_ref()
                    .and_then(|a| self.controls.get(&a.state))
                    .and_then(|c| c.last_drops_minimum_time);
                match ldmt {
                    Some(t) if t > 0.0 => {
                        if let Some(a) = &mut self.active {
                            a.last_drops_deadline = Some(now + t);
                        }
                    }
                    _ => self.set_gate(GateName::LastDrops, now, None),
                }
            }
            GateName::FlowStateExit | GateName::LastDrops => self.maybe_complete(now),
            _ => {}
        }
    }

    fn maybe_complete(&mut self, now: f64) {
        let done = self.active.as_ref().is_some_and(|a| {
            !a.complete
                && a.gates.is_set(GateName::FlowStateExit)
                && a.gates.is_set(GateName::LastDrops)
        });
        if done {
            self.close_sequence(now, None);
        }
    }

    fn close_sequence(&mut self, now: f64, reason: Option<CloseReason>) {
        let Some(active) = &mut self.active else {
            return;
        };
        if active.complete {
            return;
        }
        active.complete = true;
        active.sat_active = false;
        active.sav_active = false;
        active.saw_active = false;
        active.sat_deadline = None;
        active.last_drops_deadline = None;
        active.gates.set(GateName::SequenceComplete);
        self.publish_gate(GateName::SequenceComplete, GateAction::Set, reason, now);
        tracing::info!("gate: SequenceComplete ({reason:?})");
        if self.scale.hold_at_tare() {
            self.scale.set_hold_at_tare(false);
            self.notify_auto_tare(AutoTareAction::Disabled, now);
        }
    }

    fn arm_stop_at_time(&mut self, now: f64) {
        let Some(active) = &self.active else {
            return;
        };
        let Some(control) = self.controls.get(&active.state) else {
            return;
        };
        if control.time_managed_by_de1() || !control.supports(StopAtKind::Time) {
            return;
        }
        match control.stop_at(StopAtKind::Time) {
            Some(t) if t > 0.0 => {
                if let Some(a) = &mut self.active {
                    a.sat_active = true;
                    a.sat_deadline = Some(now + t);
                }
                self.notify_stop_at(StopAtKind::Time, StopAtAction::Enabled, None, now);
            }
            _ => {}
        }
    }

    fn arm_stop_at_volume(&mut self, now: f64) {
        let armed = self.active.as_ref().is_some_and(|a| {
            self.controls
                .get(&a.state)
                .is_some_and(|c| c.supports(StopAtKind::Volume) && c.stop_at(StopAtKind::Volume).is_some())
        });
        if armed {
            if let Some(a) = &mut self.active {
                a.sav_active = true;
            }
            self.notify_stop_at(StopAtKind::Volume, StopAtAction::Enabled, None, now);
        }
    }

    fn arm_stop_at_weight(&mut self, now: f64) {
        let armed = self.active.as_ref().is_some_and(|a| {
            !a.saw_unavailable
                && self.controls.get(&a.state).is_some_and(|c| {
                    c.supports(StopAtKind::Weight) && c.stop_at(StopAtKind::Weight).is_some()
                })
        });
        if armed {
            if let Some(a) = &mut self.active {
                a.saw_active = true;
            }
            self.notify_stop_at(StopAtKind::Weight, StopAtAction::Enabled, None, now);
        }
    }

    fn disarm_stop_ats(&mut self, now: f64) {
        let Some(active) = &mut self.active else {
            return;
        };
        let was = (active.sat_active, active.sav_active, active.saw_active);
        active.sat_active = false;
        active.sav_active = false;
        active.saw_active = false;
        active.sat_deadline = None;
        if was.0 {
            self.notify_stop_at(StopAtKind::Time, StopAtAction::Disabled, None, now);
        }
        if was.1 {
            self.notify_stop_at(StopAtKind::Volume, StopAtAction::Disabled, None, now);
        }
        if was.2 {
            self.notify_stop_at(StopAtKind::Weight, StopAtAction::Disabled, None, now);
        }
    }

    fn check_stop_at_volume(&mut self, volume_pour: f64, now: f64) {
        let Some(active) = &mut self.active else {
            return;
        };
        if !active.sav_active || active.sav_triggered {
            return;
        }
        let Some(target) = self
            .controls
            .get(&active.state)
            .and_then(|c| c.stop_at(StopAtKind::Volume))
        else {
            return;
        };
        if volume_pour >= target {
            active.sav_triggered = true;
            self.de1.request_state(MachineState::Idle);
            tracing::info!(
                "stop-at-volume triggered at {volume_pour:.1} mL for {target:.1} mL target"
            );
            self.notify_stop_at(
                StopAtKind::Volume,
                StopAtAction::Triggered,
                Some(volume_pour),
                now,
            );
        }
    }

    fn check_stop_at_time(&mut self, now: f64) {
        let Some(active) = &mut self.active else {
            return;
        };
        if !active.sat_active || active.sat_triggered {
            return;
        }
        let Some(deadline) = active.sat_deadline else {
            return;
        };
        if now >= deadline {
            active.sat_triggered = true;
            active.sat_deadline = None;
            let elapsed = active.flow_begin_time.map(|t| now - t);
            self.de1.request_state(MachineState::Idle);
            tracing::info!("stop-at-time triggered after {elapsed:?} s");
            self.notify_stop_at(StopAtKind::Time, StopAtAction::Triggered, elapsed, now);
        }
    }

    fn publish_gate(
        &self,
        gate: GateName,
        action: GateAction,
        reason: Option<CloseReason>,
        now: f64,
    ) {
        let Some(active) = &self.active else {
            return;
        };
        self.bus.publish(
            SENDER,
            now,
            Payload::SequencerGate(SequencerGateNotification {
                name: gate,
                action,
                sequence_id: active.id.clone(),
                active_state: active.state,
                reason,
            }),
        );
    }

    fn notify_stop_at(
        &self,
        kind: StopAtKind,
        action: StopAtAction,
        current: Option<f64>,
        now: f64,
    ) {
        let Some(active) = &self.active else {
            return;
        };
        let target = if action == StopAtAction::Disabled {
            None
        } else {
            self.controls
                .get(&active.state)
                .and_then(|c| c.stop_at(kind))
        };
        self.bus.publish(
            SENDER,
            now,
            Payload::StopAt(StopAtNotification {
                stop_at: kind,
                action,
                target_value: target,
                current_value: current,
                active_state: active.state,
            }),
        );
    }

    fn notify_auto_tare(&self, action: AutoTareAction, now: f64) {
        self.bus
            .publish(SENDER, now, Payload::AutoTare(AutoTareNotification { action }));
    }
}
