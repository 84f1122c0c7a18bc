#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod ipc;
pub mod outbound;
pub mod paths;
pub mod profile;
pub mod recorder;
pub mod scale;
pub mod sequencer;
pub mod supervise;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at the crate root.
pub use crate::config::Config;
pub use crate::event::{Clock, Envelope, EventBus, EventKind, Payload, SystemClock};
pub use crate::sequencer::{FlowSequencer, MachineState, Substate};
