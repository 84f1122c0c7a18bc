//! Daemon wiring: the core event loop and its worker threads.

mod core;
mod run;

pub use core::{Core, CoreSnapshots};
pub use run::{DaemonDeps, RoleTransport, run, run_with, serve_requests};
