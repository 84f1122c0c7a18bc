//! Forwarding of bus traffic to the external notification transport.
//!
//! Every published payload goes out as a framed JSON message tagged
//! with its topic, `{TOPIC_ROOT}/{Kind}`, retention on. The transport
//! process on the far side of the pipe owns broker specifics (session,
//! will message, reconnect).

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::{Envelope, Subscription};
use crate::ipc;

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub topic: String,
    pub retain: bool,
    pub payload: Envelope,
}

pub fn topic_for(topic_root: &str, env: &Envelope) -> String {
    format!("{topic_root}/{}", env.kind().as_str())
}

/// Drain a bus subscription into the outbound pipe until shutdown.
pub fn run_forwarder<W: Write>(
    sub: Subscription,
    mut writer: W,
    topic_root: String,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match sub.recv_timeout(Duration::from_millis(100)) {
            Some(env) => {
                let frame = NotificationFrame {
                    topic: topic_for(&topic_root, &env),
                    retain: true,
                    payload: env,
                };
                if let Err(e) = ipc::write_frame(&mut writer, &frame) {
                    tracing::error!("outbound write failed: {e}");
                    break;
                }
            }
            None => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
    tracing::info!("outbound forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, ManualClock, Payload, WaterLevel};

    #[test]
    fn frames_carry_topic_and_payload() {
        let bus = EventBus::new(Arc::new(ManualClock::new(0.0)));
        let env = bus.publish(
            "DE1",
            1.0,
            Payload::WaterLevel(WaterLevel {
                level: 20.0,
                start_fill_level: 5.0,
            }),
        );
        assert_eq!(topic_for("pyDE1", &env), "pyDE1/WaterLevelUpdate");

        let frame = NotificationFrame {
            topic: topic_for("pyDE1", &env),
            retain: true,
            payload: env,
        };
        let bytes = ipc::encode_frame(&frame).unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let back: NotificationFrame = ipc::read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(back.topic, "pyDE1/WaterLevelUpdate");
        assert!(back.retain);
        assert_eq!(back.payload.arrival_time, 1.0);
    }
}
