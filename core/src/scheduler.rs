//! Cancellable periodic background jobs

use crate::error::BridgeError;
use crate::traits::BridgeResult;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A periodic job; returning `false` ends the job
pub struct PeriodicJob {
    pub name: &'static str,
    pub period: Duration,
    pub run: Box<dyn FnMut() -> bool + Send + 'static>,
}

impl PeriodicJob {
    pub fn new<F>(name: &'static str, period: Duration, run: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self {
            name,
            period,
            run: Box::new(run),
        }
    }
}

/// Owns the background tasks of one component
pub struct Scheduler {
    owner: &'static str,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn all jobs unless already running
    ///
    /// Returns `Ok(false)` when the scheduler was already started.
    pub fn start(&self, jobs: Vec<PeriodicJob>) -> BridgeResult<bool> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(false);
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| BridgeError::SchedulerUnavailable)?;

        for job in jobs {
            let owner = self.owner;
            let PeriodicJob {
                name,
                period,
                mut run,
            } = job;

            tasks.push(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    if !run() {
                        debug!("{} job '{}' finished", owner, name);
                        break;
                    }
                }
            }));
        }

        debug!("{} scheduler started with {} jobs", self.owner, tasks.len());
        Ok(true)
    }

    /// Cancel every outstanding job; returns the number cancelled
    pub fn stop(&self) -> usize {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        if !tasks.is_empty() {
            debug!("{} scheduler stopped ({} jobs)", self.owner, tasks.len());
        }
        tasks.len()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
