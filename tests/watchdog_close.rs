//! Abnormal sequence closes: device loss and the watchdog, end to end
//! through the bus into the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use de1d::event::{
    CloseReason, EventBus, EventKind, GateAction, GateName, ManualClock, Payload,
};
use de1d::recorder::{
    HistoryStore, Recorder, SequenceSnapshots, SharedStore, SnapshotSource, into_shared,
};
use de1d::sequencer::{
    FlowSequencer, MachineState, ScaleLink, SequencerSettings, StateRequester,
};

struct NoProfile;

impl SnapshotSource for NoProfile {
    fn snapshots(&self) -> SequenceSnapshots {
        SequenceSnapshots::default()
    }

    fn latest_profile_id(&self) -> Option<String> {
        None
    }

    fn active_state_name(&self) -> String {
        "Espresso".into()
    }
}

struct CountingDe1 {
    stops: AtomicUsize,
}

impl StateRequester for CountingDe1 {
    fn request_state(&self, _state: MachineState) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    bus: EventBus,
    seq: FlowSequencer,
    recorder: Recorder,
    store: SharedStore,
    recorder_sub: de1d::event::Subscription,
    de1: Arc<CountingDe1>,
    _dir: tempfile::TempDir,
}

fn rig() -> Rig {
    let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
    let de1 = Arc::new(CountingDe1 {
        stops: AtomicUsize::new(0),
    });
    let scale = Arc::new(ScaleLink::new());
    let seq = FlowSequencer::with_settings(
        bus.clone(),
        de1.clone(),
        scale,
        SequencerSettings::default(),
    );
    let dir = tempfile::tempdir().unwrap();
    let store = into_shared(
        HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap(),
    );
    let recorder_sub = bus.subscribe("recorder", None);
    let recorder = Recorder::new(store.clone(), Box::new(NoProfile), 2.0);
    Rig {
        bus,
        seq,
        recorder,
        store,
        recorder_sub,
        de1,
        _dir: dir,
    }
}

impl Rig {
    fn pump_recorder(&mut self) {
        while let Some(env) = self.recorder_sub.try_recv() {
            self.recorder.on_envelope(&env).unwrap();
        }
    }
}

fn espresso_start() -> de1d::event::StateUpdate {
    de1d::event::StateUpdate {
        state: MachineState::Espresso,
        substate: de1d::sequencer::Substate::PreInfuse,
        previous_state: MachineState::Idle,
        previous_substate: de1d::sequencer::Substate::NoState,
    }
}

#[test]
fn de1_loss_closes_the_sequence_cleanly() {
    let mut r = rig();
    let gate_sub = r.bus.subscribe("gates", Some(&[EventKind::SequencerGate]));

    r.seq.on_state_update(&espresso_start(), 0.0);
    let sequence_id = r.seq.sequence_id().to_string();
    r.pump_recorder();
    assert!(r.recorder.is_recording());

    // The machine disappears ten seconds in.
    r.seq.on_de1_disconnected(10.0);
    r.pump_recorder();

    let mut close_reason = None;
    while let Some(env) = gate_sub.try_recv() {
        if let Payload::SequencerGate(g) = env.payload
            && g.name == GateName::SequenceComplete
            && g.action == GateAction::Set
        {
            close_reason = g.reason;
        }
    }
    assert_eq!(close_reason, Some(CloseReason::DeviceLost));
    assert!(!r.recorder.is_recording());

    let (_, _, _, end) = r
        .store
        .lock()
        .unwrap()
        .sequence_times(&sequence_id)
        .unwrap()
        .unwrap();
    assert_eq!(end, Some(10.0));
}

#[test]
fn watchdog_bounds_a_stuck_sequence() {
    let mut r = rig();
    r.seq.on_state_update(&espresso_start(), 0.0);
    let sequence_id = r.seq.sequence_id().to_string();
    r.pump_recorder();

    // Nothing else ever arrives; the watchdog closes it and asks for
    // Idle.
    r.seq.on_tick(271.0);
    r.pump_recorder();

    assert_eq!(r.de1.stops.load(Ordering::SeqCst), 1);
    assert!(!r.recorder.is_recording());
    let (_, _, _, end) = r
        .store
        .lock()
        .unwrap()
        .sequence_times(&sequence_id)
        .unwrap()
        .unwrap();
    assert_eq!(end, Some(271.0));

    // Recorder is back in ring mode: later samples stay unattributed.
    assert_eq!(
        r.store
            .lock()
            .unwrap()
            .count_rows("sequencer_gate_notification", &sequence_id)
            .unwrap(),
        11 // 8 clears + SequenceStart + FlowBegin + SequenceComplete
    );
}
