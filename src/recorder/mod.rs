//! Sequence recorder: no-data-loss capture of bus traffic into the
//! history store.
//!
//! Outside a sequence the recorder only feeds its ring buffers. When
//! `SequenceStart` latches it creates the sequence row, retroactively
//! tags the buffered pre-history, and streams everything until the
//! matching `SequenceComplete` is seen.

pub mod legacy;
mod ring;
mod schema;
pub mod store;

pub use ring::RingBuffer;
pub use schema::{CURRENT_USER_VERSION, schema_v1_for_tests};
pub use store::{
    HistoryStore, PRE_SEQUENCE_ID, SequenceRow, SequenceSnapshots, SharedStore, into_shared,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::event::{Envelope, GateAction, GateName, Payload, Subscription};
use crate::Result;

/// Batch commit interval, seconds of event time.
const COMMIT_INTERVAL: f64 = 0.100;

/// How long after `SequenceComplete` events are still attributed to the
/// closed sequence. Other senders (the scale processor in particular)
/// publish independently of the sequencer, so a trailing sample may
/// legally arrive after the close.
const POST_SEQUENCE_GRACE: f64 = 1.0;

/// Cached-state provider for the snapshot columns of a new sequence
/// row. Implementations must not touch the wire.
pub trait SnapshotSource: Send {
    fn snapshots(&self) -> SequenceSnapshots;
    fn latest_profile_id(&self) -> Option<String>;
    fn active_state_name(&self) -> String;
}

enum Mode {
    Ring,
    Streaming {
        sequence_id: String,
    },
    /// Sequence closed; stragglers keep their attribution until the
    /// grace deadline (event time) passes.
    Draining {
        sequence_id: String,
        until_event_time: f64,
    },
}

pub struct Recorder {
    store: SharedStore,
    ring: RingBuffer,
    mode: Mode,
    pre_sequence_window: f64,
    snapshots: Box<dyn SnapshotSource>,
    last_commit_event_time: f64,
}

impl Recorder {
    pub fn new(
        store: SharedStore,
        snapshots: Box<dyn SnapshotSource>,
        pre_sequence_window: f64,
    ) -> Self {
        Self {
            store,
            ring: RingBuffer::new(),
            mode: Mode::Ring,
            pre_sequence_window,
            snapshots,
            last_commit_event_time: 0.0,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.mode, Mode::Streaming { .. })
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, HistoryStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume one bus envelope. The ring buffers stay populated in
    /// every mode so pre-history is always available.
    pub fn on_envelope(&mut self, env: &Envelope) -> Result<()> {
        self.ring.push(env.clone());

        if let Payload::SequencerGate(gate) = &env.payload
            && gate.name == GateName::SequenceStart
            && gate.action == GateAction::Set
        {
            let sequence_id = gate.sequence_id.clone();
            self.start_sequence(env, &sequence_id)?;
            return Ok(());
        }

        // A spent grace window flips back to ring mode before this
        // event is considered for attribution.
        if let Mode::Draining {
            until_event_time, ..
        } = &self.mode
            && env.event_time >= *until_event_time
        {
            self.mode = Mode::Ring;
            tracing::debug!("post-sequence grace expired, recorder back to ring mode");
        }

        let (sequence_id, streaming) = match &self.mode {
            Mode::Ring => return Ok(()),
            Mode::Streaming { sequence_id } => (sequence_id.clone(), true),
            Mode::Draining { sequence_id, .. } => (sequence_id.clone(), false),
        };

        let mut store = self.lock_store();
        store.begin_batch()?;
        store.insert_notification(env, &sequence_id)?;

        if streaming
            && let Payload::SequencerGate(gate) = &env.payload
            && gate.action == GateAction::Set
            && gate.sequence_id == sequence_id
        {
            match gate.name {
                GateName::FlowBegin => {
                    store.set_sequence_start_flow(&sequence_id, env.arrival_time)?;
                }
                GateName::FlowEnd => {
                    store.set_sequence_end_flow(&sequence_id, env.arrival_time)?;
                }
                GateName::SequenceComplete => {
                    store.set_sequence_end(&sequence_id, env.arrival_time)?;
                    store.commit_batch()?;
                    drop(store);
                    self.mode = Mode::Draining {
                        sequence_id: sequence_id.clone(),
                        until_event_time: env.event_time + POST_SEQUENCE_GRACE,
                    };
                    tracing::info!(
                        sequence_id = sequence_id.as_str(),
                        "sequence closed, draining stragglers"
                    );
                    return Ok(());
                }
                _ => {}
            }
        }

        if env.event_time - self.last_commit_event_time >= COMMIT_INTERVAL {
            store.commit_batch()?;
            drop(store);
            self.last_commit_event_time = env.event_time;
        }
        Ok(())
    }

    fn start_sequence(&mut self, env: &Envelope, sequence_id: &str) -> Result<()> {
        let mut store = self.lock_store();

        // Close out anything left open; the new sequence wins.
        if let Mode::Streaming {
            sequence_id: old_id,
        } = &self.mode
        {
            tracing::warn!("sequence {old_id} never completed; closing at new sequence start");
            store.set_sequence_end(old_id, env.arrival_time)?;
        }
        store.commit_batch()?;

        let (profile_id, profile_assumed) = match self.snapshots.latest_profile_id() {
            Some(id) => (Some(id), false),
            // Best guess: whatever was uploaded most recently, possibly
            // in an earlier run.
            None => (store.last_profile_id()?, true),
        };

        let row = SequenceRow {
            id: sequence_id.to_string(),
            active_state: self.snapshots.active_state_name(),
            start_sequence: env.arrival_time,
            profile_id,
            profile_assumed,
            snapshots: self.snapshots.snapshots(),
        };

        store.begin_batch()?;
        store.insert_sequence(&row)?;
        let backlog =
            self.ring
                .items_for_sequence(sequence_id, env.arrival_time, self.pre_sequence_window);
        let count = backlog.len();
        for item in &backlog {
            store.insert_notification(item, sequence_id)?;
        }
        store.commit_batch()?;
        drop(store);
        self.last_commit_event_time = env.event_time;
        tracing::info!(
            sequence_id,
            backlog = count,
            "recorder streaming under new sequence"
        );

        self.mode = Mode::Streaming {
            sequence_id: sequence_id.to_string(),
        };
        Ok(())
    }

    /// Flush everything and stop; part of the ordered shutdown drain.
    pub fn finish(&mut self) -> Result<()> {
        self.lock_store().commit_batch()
    }

    /// Blocking loop for the recorder thread.
    pub fn run(mut self, sub: Subscription, shutdown: Arc<AtomicBool>) {
        loop {
            match sub.recv_timeout(Duration::from_millis(100)) {
                Some(env) => {
                    if let Err(e) = self.on_envelope(&env) {
                        tracing::error!("recorder write failed: {e}");
                    }
                }
                None => {
                    // Idle: push any open batch out.
                    if let Err(e) = self.finish() {
                        tracing::error!("recorder commit failed: {e}");
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        // Drain whatever is still queued before closing the store.
        while let Some(env) = sub.try_recv() {
            if let Err(e) = self.on_envelope(&env) {
                tracing::error!("recorder write failed during drain: {e}");
            }
        }
        if let Err(e) = self.finish() {
            tracing::error!("recorder final flush failed: {e}");
        }
        tracing::info!("recorder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SequencerGateNotification, ShotSample};
    use crate::sequencer::MachineState;

    struct FixedSnapshots;

    impl SnapshotSource for FixedSnapshots {
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

    fn recorder() -> (Recorder, SharedStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = into_shared(
            HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap(),
        );
        (
            Recorder::new(store.clone(), Box::new(FixedSnapshots), 2.0),
            store,
            dir,
        )
    }

    fn sample_at(t: f64) -> Envelope {
        Envelope {
            version: "1.0.0".into(),
            sender: "DE1".into(),
            arrival_time: t,
            create_time: t,
            event_time: t,
            payload: Payload::ShotSample(ShotSample {
                de1_time: t,
                group_pressure: 8.0,
                group_flow: 2.0,
                mix_temp: 92.0,
                head_temp: 92.0,
                frame_number: 1,
                volume_preinfuse: 0.0,
                volume_pour: 0.0,
                volume_total: 0.0,
            }),
        }
    }

    fn gate_at(t: f64, name: GateName, sequence_id: &str) -> Envelope {
        Envelope {
            version: "1.1.0".into(),
            sender: "FlowSequencer".into(),
            arrival_time: t,
            create_time: t,
            event_time: t,
            payload: Payload::SequencerGate(SequencerGateNotification {
                name,
                action: GateAction::Set,
                sequence_id: sequence_id.into(),
                active_state: MachineState::Espresso,
                reason: None,
            }),
        }
    }

    #[test]
    fn pre_sequence_items_are_retagged_and_streaming_continues() {
        let (mut rec, store, _dir) = recorder();
        // Three samples before the sequence, all within the window.
        for t in [-1.8, -1.2, -0.4] {
            rec.on_envelope(&sample_at(t)).unwrap();
        }
        rec.on_envelope(&gate_at(0.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        for t in [0.2, 0.4, 0.6] {
            rec.on_envelope(&sample_at(t)).unwrap();
        }
        rec.on_envelope(&gate_at(1.0, GateName::SequenceComplete, "seq-1"))
            .unwrap();

        assert_eq!(
            store
                .lock()
                .unwrap()
                .count_rows("shot_sample_with_volume_update", "seq-1")
                .unwrap(),
            6
        );
        assert!(!rec.is_recording());
    }

    #[test]
    fn window_excludes_stale_samples() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&sample_at(-5.0)).unwrap();
        rec.on_envelope(&sample_at(-0.5)).unwrap();
        rec.on_envelope(&gate_at(0.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(1.0, GateName::SequenceComplete, "seq-1"))
            .unwrap();
        assert_eq!(
            store
                .lock()
                .unwrap()
                .count_rows("shot_sample_with_volume_update", "seq-1")
                .unwrap(),
            1
        );
    }

    #[test]
    fn gate_timestamps_land_in_sequence_row() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&gate_at(10.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(11.0, GateName::FlowBegin, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(38.0, GateName::FlowEnd, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(41.0, GateName::SequenceComplete, "seq-1"))
            .unwrap();
        let (start, flow_start, flow_end, end) =
            store.lock().unwrap().sequence_times("seq-1").unwrap().unwrap();
        assert_eq!(start, 10.0);
        assert_eq!(flow_start, Some(11.0));
        assert_eq!(flow_end, Some(38.0));
        assert_eq!(end, Some(41.0));
        assert!(start <= flow_start.unwrap());
        assert!(flow_end.unwrap() <= end.unwrap());
    }

    #[test]
    fn out_of_sequence_events_only_feed_the_ring() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&sample_at(0.0)).unwrap();
        store.lock().unwrap().commit_batch().unwrap();
        assert_eq!(
            store
                .lock()
                .unwrap()
                .count_rows("shot_sample_with_volume_update", PRE_SEQUENCE_ID)
                .unwrap(),
            0
        );
        assert_eq!(rec.ring.len(), 1);
    }

    #[test]
    fn abandoned_sequence_is_closed_by_the_next_start() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&gate_at(0.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(100.0, GateName::SequenceStart, "seq-2"))
            .unwrap();
        let (_, _, _, end) = store.lock().unwrap().sequence_times("seq-1").unwrap().unwrap();
        assert_eq!(end, Some(100.0));
        assert!(rec.is_recording());
    }

    #[test]
    fn stragglers_within_the_grace_window_keep_their_sequence() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&gate_at(0.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(1.0, GateName::SequenceComplete, "seq-1"))
            .unwrap();
        assert!(!rec.is_recording());

        // The scale publishes independently of the sequencer; a sample
        // landing just after the close still belongs to the shot.
        rec.on_envelope(&sample_at(1.5)).unwrap();
        // One landing after the grace deadline does not.
        rec.on_envelope(&sample_at(2.5)).unwrap();

        assert_eq!(
            store
                .lock()
                .unwrap()
                .count_rows("shot_sample_with_volume_update", "seq-1")
                .unwrap(),
            1
        );
    }

    #[test]
    fn gates_from_other_sequences_stay_out_of_the_backlog() {
        let (mut rec, store, _dir) = recorder();
        rec.on_envelope(&gate_at(-1.0, GateName::FlowBegin, "seq-0"))
            .unwrap();
        rec.on_envelope(&gate_at(0.0, GateName::SequenceStart, "seq-1"))
            .unwrap();
        rec.on_envelope(&gate_at(1.0, GateName::SequenceComplete, "seq-1"))
            .unwrap();
        assert_eq!(
            store
                .lock()
                .unwrap()
                .count_rows("sequencer_gate_notification", "seq-1")
                .unwrap(),
            2
        );
    }
}
