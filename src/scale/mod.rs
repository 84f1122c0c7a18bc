//! Scale processor: raw weight reports in, smoothed weight and
//! estimated flow out.
//!
//! Raw reports are noisy and arrive at ~10 Hz. Weight is a median over
//! a short window; flow is the least-squares slope over a longer one.
//! The processor also owns tare behaviour: while `hold_at_tare` is set
//! it re-tares away any drift, so the cup lands on a zeroed scale.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::event::{EventBus, Payload, ScaleTareSeen, WeightAndFlow};
use crate::sequencer::ScaleLink;

const SENDER: &str = "ScaleProcessor";

const MEDIAN_WINDOW: usize = 5;
const FLOW_WINDOW: usize = 11;
/// Drift beyond this re-arms a tare while holding.
const TARE_TOLERANCE_G: f64 = 0.10;
/// Minimum spacing between tare requests, seconds.
const TARE_REQUEST_INTERVAL: f64 = 0.25;

/// Issues the actual tare command to whatever scale is captured.
pub trait TareSink: Send + Sync {
    fn tare(&self) -> Result<(), String>;
}

pub struct ScaleProcessor {
    bus: EventBus,
    link: Arc<ScaleLink>,
    tare: Arc<dyn TareSink>,
    history: VecDeque<(f64, f64)>,
    last_tare_request: f64,
    tare_pending: bool,
}

impl ScaleProcessor {
    pub fn new(bus: EventBus, link: Arc<ScaleLink>, tare: Arc<dyn TareSink>) -> Self {
        Self {
            bus,
            link,
            tare,
            history: VecDeque::with_capacity(FLOW_WINDOW),
            last_tare_request: f64::MIN,
            tare_pending: false,
        }
    }

    /// One raw report from the scale adapter.
    pub fn on_weight_report(&mut self, scale_time: f64, weight: f64, now: f64) {
        if self.link.hold_at_tare()
            && weight.abs() > TARE_TOLERANCE_G
            && now - self.last_tare_request >= TARE_REQUEST_INTERVAL
        {
            match self.tare.tare() {
                Ok(()) => {
                    self.last_tare_request = now;
                    self.tare_pending = true;
                }
                Err(e) => tracing::warn!("tare request failed: {e}"),
            }
        }

        if self.tare_pending && weight.abs() <= TARE_TOLERANCE_G {
            self.tare_pending = false;
            self.bus
                .publish(SENDER, now, Payload::ScaleTare(ScaleTareSeen { scale_time }));
        }

        while self.history.len() >= FLOW_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back((scale_time, weight));

        let (current_weight, current_weight_time) = self.median_weight();
        let (average_flow, average_flow_time) = self.flow_estimate();
        self.bus.publish(
            SENDER,
            now,
            Payload::WeightAndFlow(WeightAndFlow {
                scale_time,
                current_weight,
                current_weight_time,
                average_flow,
                average_flow_time,
            }),
        );
    }

    /// The physical scale changed or dropped; stale history would skew
    /// both estimates.
    pub fn reset(&mut self) {
        self.history.clear();
        self.tare_pending = false;
    }

    pub fn link(&self) -> &Arc<ScaleLink> {
        &self.link
    }

    fn median_weight(&self) -> (f64, f64) {
        let n = self.history.len().min(MEDIAN_WINDOW);
        let tail: Vec<(f64, f64)> = self.history.iter().rev().take(n).cloned().collect();
        let mut weights: Vec<f64> = tail.iter().map(|(_, w)| *w).collect();
        weights.sort_by(|a, b| a.total_cmp(b));
        let median = weights[weights.len() / 2];
        // The estimate is centered on the window, not its trailing edge.
        let mid_time = tail[tail.len() / 2].0;
        (median, mid_time)
    }

    fn flow_estimate(&self) -> (f64, f64) {
        let n = self.history.len();
        if n < 2 {
            let t = self.history.back().map(|(t, _)| *t).unwrap_or(0.0);
            return (0.0, t);
        }
        let mean_t: f64 = self.history.iter().map(|(t, _)| t).sum::<f64>() / n as f64;
        let mean_w: f64 = self.history.iter().map(|(_, w)| w).sum::<f64>() / n as f64;
        let mut num = 0.0;
        let mut den = 0.0;
        for (t, w) in &self.history {
            num += (t - mean_t) * (w - mean_w);
            den += (t - mean_t) * (t - mean_t);
        }
        let slope = if den > 0.0 { num / den } else { 0.0 };
        (slope, mean_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::event::{EventKind, ManualClock};

    struct RecordingTare {
        count: Mutex<u32>,
    }

    impl RecordingTare {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: Mutex::new(0),
            })
        }

        fn count(&self) -> u32 {
            *self.count.lock().unwrap()
        }
    }

    impl TareSink for RecordingTare {
        fn tare(&self) -> Result<(), String> {
            *self.count.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn processor() -> (ScaleProcessor, EventBus, Arc<ScaleLink>, Arc<RecordingTare>) {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let link = Arc::new(ScaleLink::new());
        let tare = RecordingTare::new();
        let proc = ScaleProcessor::new(bus.clone(), link.clone(), tare.clone());
        (proc, bus, link, tare)
    }

    #[test]
    fn steady_pour_estimates_flow() {
        let (mut proc, bus, _link, _tare) = processor();
        let sub = bus.subscribe("t", Some(&[EventKind::WeightAndFlow]));
        // 2 g/s at 10 Hz.
        for n in 0..FLOW_WINDOW {
            let t = n as f64 * 0.1;
            proc.on_weight_report(t, 2.0 * t, t);
        }
        let mut last = None;
        while let Some(env) = sub.try_recv() {
            if let Payload::WeightAndFlow(w) = env.payload {
                last = Some(w);
            }
        }
        let w = last.unwrap();
        assert!((w.average_flow - 2.0).abs() < 1e-6);
        assert!((w.current_weight - 1.6).abs() < 1e-6); // median of last 5
    }

    #[test]
    fn median_suppresses_a_spike() {
        let (mut proc, bus, _link, _tare) = processor();
        let sub = bus.subscribe("t", Some(&[EventKind::WeightAndFlow]));
        for (n, w) in [10.0, 10.1, 55.0, 10.2, 10.3].iter().enumerate() {
            proc.on_weight_report(n as f64 * 0.1, *w, n as f64 * 0.1);
        }
        let mut last = None;
        while let Some(env) = sub.try_recv() {
            if let Payload::WeightAndFlow(w) = env.payload {
                last = Some(w);
            }
        }
        assert!((last.unwrap().current_weight - 10.2).abs() < 1e-6);
    }

    #[test]
    fn hold_at_tare_retares_on_drift() {
        let (mut proc, bus, link, tare) = processor();
        let sub = bus.subscribe("t", Some(&[EventKind::ScaleTare]));
        link.set_hold_at_tare(true);

        proc.on_weight_report(0.0, 18.4, 0.0);
        assert_eq!(tare.count(), 1);
        // Within the request interval: no second command.
        proc.on_weight_report(0.1, 18.4, 0.1);
        assert_eq!(tare.count(), 1);
        // The tare lands; a ScaleTareSeen goes out.
        proc.on_weight_report(0.3, 0.02, 0.3);
        assert!(sub.try_recv().is_some());

        link.set_hold_at_tare(false);
        proc.on_weight_report(0.6, 25.0, 0.6);
        assert_eq!(tare.count(), 1);
    }
}
