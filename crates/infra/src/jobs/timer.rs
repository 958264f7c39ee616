//! Timer sweep: turns due timer jobs into executable jobs.
//!
//! The sweep never executes anything itself. A promoted timer is picked up by
//! the acquisition loop like any other executable job.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use flowforge_core::{ExpectedVersion, SharedClock};

use super::store::{JobStoreError, SharedJobStore};

#[derive(Debug, Clone)]
pub struct TimerSweepConfig {
    /// Pause between sweeps that did not hit the per-sweep limit
    pub wait: Duration,
    pub max_timers_per_acquisition: usize,
}

impl Default for TimerSweepConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(5000),
            max_timers_per_acquisition: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    /// Timers promoted (or deleted) concurrently by someone else
    pub skipped: usize,
}

pub struct TimerSweep {
    store: SharedJobStore,
    clock: SharedClock,
    config: TimerSweepConfig,
}

impl TimerSweep {
    pub fn new(store: SharedJobStore, clock: SharedClock, config: TimerSweepConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Promote every due timer found in one batch.
    pub async fn run_cycle(&self) -> Result<SweepReport, JobStoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let due = self
            .store
            .find_due_timers(now, self.config.max_timers_per_acquisition)
            .await?;

        for timer in due {
            let promoted = self
                .store
                .promote_timer(timer.id, ExpectedVersion::Exact(timer.version), now)
                .await?;
            if promoted {
                debug!(job_id = %timer.id, handler_type = %timer.handler_type, "timer due");
                report.promoted += 1;
            } else {
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(wait_ms = self.config.wait.as_millis() as u64, "timer job sweep started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.run_cycle().await {
                Ok(report)
                    if report.promoted + report.skipped >= self.config.max_timers_per_acquisition =>
                {
                    Duration::ZERO
                }
                Ok(_) => self.config.wait,
                Err(e) => {
                    error!(error = %e, "timer job sweep failed");
                    self.config.wait
                }
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("timer job sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowforge_core::{Clock, ManualClock};

    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{Job, JobState};

    fn sweep(store: SharedJobStore, clock: SharedClock, max: usize) -> TimerSweep {
        TimerSweep::new(
            store,
            clock,
            TimerSweepConfig {
                wait: Duration::from_millis(10),
                max_timers_per_acquisition: max,
            },
        )
    }

    #[tokio::test]
    async fn timer_becomes_executable_once_due() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let due_at = clock.now() + chrono::Duration::seconds(30);
        let id = store
            .insert(Job::new_timer("reminder", serde_json::json!({}), due_at, clock.now()))
            .await
            .unwrap();

        let sweep = sweep(store.clone(), clock.clone(), 8);
        assert_eq!(sweep.run_cycle().await.unwrap().promoted, 0);
        assert!(store.find_acquirable(clock.now(), 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(30));
        assert_eq!(sweep.run_cycle().await.unwrap().promoted, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Executable);
        assert_eq!(store.find_acquirable(clock.now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_respects_batch_limit() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        for _ in 0..5 {
            store
                .insert(Job::new_timer("t", serde_json::json!({}), clock.now(), clock.now()))
                .await
                .unwrap();
        }

        let sweep = sweep(store.clone(), clock.clone(), 2);
        assert_eq!(sweep.run_cycle().await.unwrap().promoted, 2);
        assert_eq!(sweep.run_cycle().await.unwrap().promoted, 2);
        assert_eq!(sweep.run_cycle().await.unwrap().promoted, 1);
        assert_eq!(sweep.run_cycle().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn concurrent_sweeps_promote_each_timer_once() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        for _ in 0..20 {
            store
                .insert(Job::new_timer("t", serde_json::json!({}), clock.now(), clock.now()))
                .await
                .unwrap();
        }

        let a = Arc::new(sweep(store.clone(), clock.clone(), 20));
        let b = Arc::new(sweep(store.clone(), clock.clone(), 20));
        let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.promoted + rb.promoted, 20);
        let stats = store.stats(clock.now()).await.unwrap();
        assert_eq!(stats.timers, 0);
        assert_eq!(stats.executable, 20);
    }
}
