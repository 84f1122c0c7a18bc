//! Event fan-out with per-subscriber bounded queues.
//!
//! Publishing never waits on subscribers. A subscriber that falls behind
//! loses its own oldest items, never anyone else's.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use super::{Clock, Envelope, EventKind, Payload, SystemClock};

const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
    clock: Arc<dyn Clock>,
}

struct BusState {
    next_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    name: String,
    kinds: Option<Vec<EventKind>>,
    tx: Sender<Envelope>,
    // Held by the bus so a full queue can shed its own oldest item.
    drain: Receiver<Envelope>,
}

impl SubscriberState {
    fn wants(&self, kind: EventKind) -> bool {
        match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&kind),
        }
    }
}

pub struct Subscription {
    id: u64,
    rx: Receiver<Envelope>,
    bus: EventBus,
}

impl Subscription {
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Envelope> {
        match self.rx.recv_timeout(timeout) {
            Ok(env) => Some(env),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn receiver(&self) -> &Receiver<Envelope> {
        &self.rx
    }

    /// Idempotent; also runs on drop.
    pub fn cancel(&self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                next_id: 1,
                subscribers: BTreeMap::new(),
            })),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(SystemClock::shared())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to the given kinds (`None` = everything), with the
    /// default queue depth.
    pub fn subscribe(&self, name: &str, kinds: Option<&[EventKind]>) -> Subscription {
        self.subscribe_with_depth(name, kinds, DEFAULT_QUEUE_DEPTH)
    }

    pub fn subscribe_with_depth(
        &self,
        name: &str,
        kinds: Option<&[EventKind]>,
        depth: usize,
    ) -> Subscription {
        let (tx, rx) = crossbeam::channel::bounded(depth.max(1));
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            SubscriberState {
                name: name.to_string(),
                kinds: kinds.map(|k| k.to_vec()),
                tx,
                drain: rx.clone(),
            },
        );
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Publish a payload, stamping `event_time` (monotonic) and, when the
    /// caller did not supply one, `create_time` (wall clock). Fan-out is
    /// in subscription order and never blocks.
    pub fn publish(&self, sender: &str, arrival_time: f64, payload: Payload) -> Envelope {
        self.publish_with_create_time(sender, arrival_time, None, payload)
    }

    pub fn publish_with_create_time(
        &self,
        sender: &str,
        arrival_time: f64,
        create_time: Option<f64>,
        payload: Payload,
    ) -> Envelope {
        let envelope = Envelope {
            version: payload.version().to_string(),
            sender: sender.to_string(),
            arrival_time,
            create_time: create_time.unwrap_or_else(|| self.clock.wall()),
            event_time: self.clock.monotonic(),
            payload,
        };

        let kind = envelope.kind();
        let mut gone = Vec::new();
        let state = self.lock_state();
        for (id, sub) in &state.subscribers {
            if !sub.wants(kind) {
                continue;
            }
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(env)) => {
                    // Shed this subscriber's oldest item and retry once.
                    match sub.drain.try_recv() {
                        Ok(dropped) => {
                            tracing::warn!(
                                subscriber = sub.name.as_str(),
                                dropped = dropped.kind().as_str(),
                                "subscriber queue full, dropped oldest event"
                            );
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                    }
                    if sub.tx.try_send(env).is_err() {
                        tracing::error!(
                            subscriber = sub.name.as_str(),
                            "subscriber queue still full, event lost for this subscriber"
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    gone.push(*id);
                }
            }
        }
        drop(state);

        if !gone.is_empty() {
            let mut state = self.lock_state();
            for id in gone {
                state.subscribers.remove(&id);
            }
        }

        envelope
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_state().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ManualClock, ShotSample, StateUpdate, WaterLevel};
    use crate::sequencer::{MachineState, Substate};

    fn sample(n: u8) -> Payload {
        Payload::ShotSample(ShotSample {
            de1_time: n as f64,
            group_pressure: 0.0,
            group_flow: 0.0,
            mix_temp: 88.0,
            head_temp: 88.0,
            frame_number: n,
            volume_preinfuse: 0.0,
            volume_pour: 0.0,
            volume_total: 0.0,
        })
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = EventBus::new(Arc::new(ManualClock::new(100.0)));
        let sub = bus.subscribe("test", None);
        bus.publish("DE1", 1.0, sample(1));
        bus.publish("DE1", 2.0, sample(2));
        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert_eq!(first.arrival_time, 1.0);
        assert_eq!(second.arrival_time, 2.0);
    }

    #[test]
    fn stamps_create_and_event_time() {
        let clock = Arc::new(ManualClock::new(500.0));
        let bus = EventBus::new(clock.clone());
        let env = bus.publish("DE1", 499.9, sample(1));
        assert_eq!(env.create_time, 500.0);
        assert_eq!(env.event_time, 500.0);

        clock.advance(1.0);
        let env = bus.publish_with_create_time("DE1", 499.9, Some(400.0), sample(2));
        assert_eq!(env.create_time, 400.0);
        assert_eq!(env.event_time, 501.0);
    }

    #[test]
    fn kind_filter_applies() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let sub = bus.subscribe("states-only", Some(&[EventKind::StateUpdate]));
        bus.publish("DE1", 0.0, sample(1));
        assert!(sub.try_recv().is_none());
        bus.publish(
            "DE1",
            0.0,
            Payload::StateUpdate(StateUpdate {
                state: MachineState::Idle,
                substate: Substate::NoState,
                previous_state: MachineState::Sleep,
                previous_substate: Substate::NoState,
            }),
        );
        assert_eq!(sub.try_recv().unwrap().kind(), EventKind::StateUpdate);
    }

    #[test]
    fn full_queue_sheds_oldest_only_for_that_subscriber() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let slow = bus.subscribe_with_depth("slow", None, 2);
        let fast = bus.subscribe("fast", None);
        for n in 0..4 {
            bus.publish("DE1", n as f64, sample(n));
        }
        // Slow kept the newest two.
        assert_eq!(slow.try_recv().unwrap().arrival_time, 2.0);
        assert_eq!(slow.try_recv().unwrap().arrival_time, 3.0);
        // Fast saw everything.
        let mut seen = 0;
        while fast.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let sub = bus.subscribe("once", None);
        assert_eq!(bus.subscriber_count(), 1);
        sub.cancel();
        sub.cancel();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(
            "Controller",
            0.0,
            Payload::WaterLevel(WaterLevel {
                level: 20.0,
                start_fill_level: 5.0,
            }),
        );
    }
}
