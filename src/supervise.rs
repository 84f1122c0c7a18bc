//! Supervised worker threads.
//!
//! Long-lived tasks restart on panic up to a capped count per time
//! window; exceeding the cap escalates to daemon shutdown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(60),
        }
    }
}

pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run `work` until it returns cleanly or the restart budget is
    /// spent. `work` is re-invoked after each panic.
    pub fn spawn<F>(&mut self, name: &str, policy: RestartPolicy, work: F)
    where
        F: Fn() + Send + 'static,
    {
        let name = name.to_string();
        let task_name = name.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut restarts = 0u32;
                let mut window_start = Instant::now();
                loop {
                    let outcome = catch_unwind(AssertUnwindSafe(&work));
                    match outcome {
                        Ok(()) => break,
                        Err(_) if shutdown.load(Ordering::Relaxed) => break,
                        Err(_) => {
                            if window_start.elapsed() > policy.window {
                                restarts = 0;
                                window_start = Instant::now();
                            }
                            restarts += 1;
                            if restarts > policy.max_restarts {
                                tracing::error!(
                                    task = task_name.as_str(),
                                    "restart budget exhausted, escalating to shutdown"
                                );
                                shutdown.store(true, Ordering::Relaxed);
                                break;
                            }
                            tracing::warn!(
                                task = task_name.as_str(),
                                restarts,
                                "task panicked, restarting"
                            );
                        }
                    }
                }
            });
        match spawned {
            Ok(handle) => self.handles.push((name, handle)),
            Err(e) => {
                tracing::error!(task = name.as_str(), "failed to spawn task: {e}");
                self.shutdown.store(true, Ordering::Relaxed);
            }
        }
    }

    /// One-shot worker owning non-recreatable state (a transport, a
    /// store connection). A panic escalates straight to shutdown.
    pub fn spawn_once<F>(&mut self, name: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.to_string();
        let task_name = name.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    tracing::error!(
                        task = task_name.as_str(),
                        "one-shot task panicked, escalating to shutdown"
                    );
                    shutdown.store(true, Ordering::Relaxed);
                }
            });
        match spawned {
            Ok(handle) => self.handles.push((name, handle)),
            Err(e) => {
                tracing::error!(task = name.as_str(), "failed to spawn task: {e}");
                self.shutdown.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Signal shutdown and wait for every task to come home.
    pub fn drain(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                tracing::warn!(task = name.as_str(), "task panicked during drain");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn clean_exit_is_not_restarted() {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut sup = Supervisor::new(shutdown);
        let counter = Arc::clone(&runs);
        sup.spawn("once", RestartPolicy::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sup.drain();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_restarts_escalate() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut sup = Supervisor::new(Arc::clone(&shutdown));
        sup.spawn(
            "flappy",
            RestartPolicy {
                max_restarts: 2,
                window: Duration::from_secs(60),
            },
            || panic!("boom"),
        );
        sup.drain();
        assert!(shutdown.load(Ordering::Relaxed));
    }
}
