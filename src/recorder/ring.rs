//! Pre-sequence ring buffers.
//!
//! One bounded deque per event class absorbs everything marked for
//! capture, whether or not a sequence is open. Depths target roughly a
//! second of data, or the last-known value for slow-moving classes.

use std::collections::{BTreeMap, VecDeque};

use crate::event::{Envelope, EventKind, Payload};

/// Classes whose history is only meaningful near the sequence start are
/// additionally filtered to the pre-sequence window on flush.
const TIME_LIMITED: [EventKind; 3] = [
    EventKind::ShotSample,
    EventKind::WeightAndFlow,
    EventKind::SequencerGate,
];

fn depth_for(kind: EventKind) -> usize {
    match kind {
        EventKind::ShotSample => 5,
        EventKind::WeightAndFlow => 10,
        EventKind::StateUpdate => 7,
        EventKind::SequencerGate => 16,
        EventKind::StopAt => 1,
        EventKind::WaterLevel => 3,
        EventKind::ScaleTare => 3,
        EventKind::AutoTare => 3,
        EventKind::ScaleButton => 3,
        EventKind::Connectivity => 8,
        EventKind::DeviceAvailability => 8,
        EventKind::ScaleChange => 2,
        EventKind::BlueDotUpdate => 3,
        // Not persisted; no pre-history needed.
        EventKind::DeviceChanged | EventKind::ScanReport => 0,
    }
}

pub struct RingBuffer {
    buffers: BTreeMap<EventKind, VecDeque<Envelope>>,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            buffers: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, env: Envelope) {
        let kind = env.kind();
        let depth = depth_for(kind);
        if depth == 0 {
            return;
        }
        let buffer = self.buffers.entry(kind).or_default();
        while buffer.len() >= depth {
            buffer.pop_front();
        }
        buffer.push_back(env);
    }

    /// Items that belong to a sequence starting at `start_time`:
    /// everything buffered, except gate notifications from other
    /// sequences and time-limited classes older than the window.
    pub fn items_for_sequence(
        &self,
        sequence_id: &str,
        start_time: f64,
        window: f64,
    ) -> Vec<Envelope> {
        let mut out = Vec::new();
        for (kind, buffer) in &self.buffers {
            for env in buffer {
                if let Payload::SequencerGate(g) = &env.payload
                    && g.sequence_id != sequence_id
                {
                    continue;
                }
                if TIME_LIMITED.contains(kind) && env.arrival_time < start_time - window {
                    continue;
                }
                out.push(env.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
