//! Acquisition loop: polls the store for due jobs and locks them.
//!
//! Locking is a compare-and-swap on the job's version. Losing the race to
//! another acquirer is expected under concurrency and is not an error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use flowforge_core::{ExpectedVersion, LockOwner, SharedClock};

use super::executor::ExecutionPool;
use super::store::{JobStoreError, SharedJobStore};
use super::types::{Job, LockToken};

/// Acquisition loop settings.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Pause between cycles that did not fill the pool
    pub wait: Duration,
    /// Lease granted on each acquired job
    pub lock_duration: Duration,
    /// Upper bound on jobs locked per cycle
    pub max_jobs_per_acquisition: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(5000),
            lock_duration: Duration::from_secs(300),
            max_jobs_per_acquisition: 8,
        }
    }
}

/// Outcome of one acquisition cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Free slots the cycle tried to fill
    pub slots: usize,
    /// Jobs locked by this cycle
    pub acquired: usize,
    /// Candidates lost to a concurrent acquirer
    pub skipped: usize,
    /// Jobs handed to the pool (including backlog)
    pub submitted: usize,
    /// Locked jobs waiting for a free worker
    pub backlogged: usize,
    /// Backlogged jobs dropped because their lease ran out
    pub expired: usize,
}

impl CycleReport {
    /// The cycle used every free slot, so more work is probably waiting.
    pub fn filled_pool(&self) -> bool {
        self.slots > 0 && self.acquired == self.slots
    }
}

/// Periodic job acquisition.
pub struct AcquisitionLoop {
    store: SharedJobStore,
    pool: Arc<ExecutionPool>,
    clock: SharedClock,
    owner: LockOwner,
    config: AcquisitionConfig,
    backlog: VecDeque<Job>,
}

impl AcquisitionLoop {
    pub fn new(
        store: SharedJobStore,
        pool: Arc<ExecutionPool>,
        clock: SharedClock,
        owner: LockOwner,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            store,
            pool,
            clock,
            owner,
            config,
            backlog: VecDeque::new(),
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Run one acquisition cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, JobStoreError> {
        let now = self.clock.now();
        let mut report = CycleReport::default();

        // Jobs locked earlier but never handed to a worker go first.
        while let Some(job) = self.backlog.pop_front() {
            let expired = job.lock.as_ref().is_none_or(|l| l.is_expired(now));
            if expired {
                debug!(job_id = %job.id, "dropping backlogged job whose lease expired");
                report.expired += 1;
                continue;
            }
            match self.pool.try_submit(job) {
                Ok(()) => report.submitted += 1,
                Err(job) => {
                    self.backlog.push_front(job);
                    break;
                }
            }
        }
        if !self.backlog.is_empty() {
            report.backlogged = self.backlog.len();
            return Ok(report);
        }

        let slots = self
            .pool
            .available_slots()
            .min(self.config.max_jobs_per_acquisition);
        report.slots = slots;
        if slots == 0 {
            return Ok(report);
        }

        let lease = chrono::Duration::from_std(self.config.lock_duration).unwrap_or_default();
        let candidates = self.store.find_acquirable(now, slots).await?;

        for candidate in candidates {
            let token = LockToken::new(self.owner.clone(), now + lease);
            let locked = self
                .store
                .try_lock(
                    candidate.id,
                    ExpectedVersion::Exact(candidate.version),
                    token,
                    now,
                )
                .await?;

            let Some(job) = locked else {
                debug!(job_id = %candidate.id, owner = %self.owner, "job taken by another acquirer");
                report.skipped += 1;
                continue;
            };

            report.acquired += 1;
            match self.pool.try_submit(job) {
                Ok(()) => report.submitted += 1,
                Err(job) => self.backlog.push_back(job),
            }
        }

        report.backlogged = self.backlog.len();
        if report.acquired > 0 {
            debug!(
                owner = %self.owner,
                acquired = report.acquired,
                skipped = report.skipped,
                backlogged = report.backlogged,
                "acquisition cycle"
            );
        }
        Ok(report)
    }

    /// Run cycles until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = %self.owner, wait_ms = self.config.wait.as_millis() as u64, "async job acquisition started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.run_cycle().await {
                Ok(report) if report.filled_pool() => Duration::ZERO,
                Ok(_) => self.config.wait,
                Err(e) => {
                    error!(owner = %self.owner, error = %e, "async job acquisition failed");
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

        self.release_backlog().await;
        info!(owner = %self.owner, "async job acquisition stopped");
    }

    /// Give back leases of jobs that never reached a worker.
    pub async fn release_backlog(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            let Some(token) = job.lock.as_ref() else {
                continue;
            };
            match self.store.release_lock(job.id, token).await {
                Ok(_) => debug!(job_id = %job.id, "released backlogged job"),
                Err(e) => error!(job_id = %job.id, error = %e, "failed to release backlogged job"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use flowforge_core::{Clock, ManualClock, SystemClock};

    use crate::jobs::executor::{ExecutionPoolConfig, JobHandlers};
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{JobResult, RetryPolicies};

    fn pool(store: SharedJobStore, handlers: Arc<JobHandlers>, clock: SharedClock, size: usize) -> Arc<ExecutionPool> {
        Arc::new(ExecutionPool::new(
            store,
            handlers,
            Arc::new(RetryPolicies::default()),
            clock,
            ExecutionPoolConfig {
                pool_size: size,
                lock_duration: Duration::from_secs(60),
            },
        ))
    }

    fn config() -> AcquisitionConfig {
        AcquisitionConfig {
            wait: Duration::from_millis(10),
            lock_duration: Duration::from_secs(60),
            max_jobs_per_acquisition: 16,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_job_is_locked_by_exactly_one_acquirer() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        for i in 0..50 {
            store
                .insert(Job::new_async("noop", serde_json::json!({ "i": i }), now))
                .await
                .unwrap();
        }

        let handlers = Arc::new(JobHandlers::new());
        // Workers never finish so every lock stays visible
        let gate = Arc::new(tokio::sync::Notify::new());
        handlers.register("noop", Arc::new(Parked(gate)));

        let mut tasks = Vec::new();
        for n in 0..5 {
            let store: SharedJobStore = store.clone();
            let handlers = handlers.clone();
            tasks.push(tokio::spawn(async move {
                let clock = SystemClock::shared();
                let pool = pool(store.clone(), handlers, clock.clone(), 50);
                let mut acq = AcquisitionLoop::new(
                    store,
                    pool,
                    clock,
                    LockOwner::new(format!("engine-{n}")),
                    AcquisitionConfig {
                        max_jobs_per_acquisition: 50,
                        ..config()
                    },
                );
                let mut acquired = 0;
                for _ in 0..5 {
                    acquired += acq.run_cycle().await.unwrap().acquired;
                }
                acquired
            }));
        }

        let mut total = 0;
        for t in tasks {
            total += t.await.unwrap();
        }
        assert_eq!(total, 50);

        let stats = store.stats(Utc::now()).await.unwrap();
        assert_eq!(stats.locked, 50);
        assert_eq!(stats.executable, 0);
    }

    struct Parked(Arc<tokio::sync::Notify>);

    #[async_trait::async_trait]
    impl crate::jobs::executor::JobHandler for Parked {
        async fn execute(&self, _job: &Job) -> JobResult {
            self.0.notified().await;
            JobResult::Success
        }
    }

    async fn lock_one(store: &InMemoryJobStore, owner: &str, clock: &ManualClock) -> Job {
        let now = clock.now();
        let snapshot = store.find_acquirable(now, 1).await.unwrap().pop().unwrap();
        store
            .try_lock(
                snapshot.id,
                ExpectedVersion::Exact(snapshot.version),
                LockToken::new(LockOwner::new(owner), now + chrono::Duration::seconds(60)),
                now,
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn saturated_pool_keeps_locked_jobs_in_backlog() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        for _ in 0..2 {
            store
                .insert(Job::new_async("parked", serde_json::json!({}), clock.now()))
                .await
                .unwrap();
        }
        let gate = Arc::new(tokio::sync::Notify::new());
        let handlers = Arc::new(JobHandlers::new());
        handlers.register("parked", Arc::new(Parked(gate.clone())));
        let p = pool(store.clone(), handlers, clock.clone(), 1);

        let busy = lock_one(&store, "a", &clock).await;
        assert!(p.try_submit(busy).is_ok());

        let mut acq = AcquisitionLoop::new(store.clone(), p.clone(), clock.clone(), LockOwner::new("a"), config());
        let waiting = lock_one(&store, "a", &clock).await;
        acq.backlog.push_back(waiting.clone());

        let report = acq.run_cycle().await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.backlogged, 1);

        // Free the worker; the backlog is submitted before anything new is acquired
        for _ in 0..20 {
            gate.notify_waiters();
            if p.available_slots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = acq.run_cycle().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(acq.backlog_len(), 0);
        for _ in 0..20 {
            gate.notify_waiters();
            if p.drain(Duration::from_millis(20)).await {
                break;
            }
        }
        assert!(store.get(waiting.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backlogged_job_with_expired_lease_is_dropped() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        store
            .insert(Job::new_async("work", serde_json::json!({}), clock.now()))
            .await
            .unwrap();
        let p = pool(store.clone(), Arc::new(JobHandlers::new()), clock.clone(), 1);
        let mut acq = AcquisitionLoop::new(store.clone(), p, clock.clone(), LockOwner::new("a"), config());

        let job = lock_one(&store, "a", &clock).await;
        acq.backlog.push_back(job);
        clock.advance(Duration::from_secs(61));

        let report = acq.run_cycle().await.unwrap();
        assert_eq!(report.expired, 1);
        // The same job is immediately re-acquired under a fresh lease
        assert_eq!(report.acquired, 1);
    }

    #[tokio::test]
    async fn release_backlog_unlocks_jobs() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        store
            .insert(Job::new_async("work", serde_json::json!({}), clock.now()))
            .await
            .unwrap();
        let p = pool(store.clone(), Arc::new(JobHandlers::new()), clock.clone(), 1);
        let mut acq = AcquisitionLoop::new(store.clone(), p, clock.clone(), LockOwner::new("a"), config());

        let job = lock_one(&store, "a", &clock).await;
        acq.backlog.push_back(job.clone());
        acq.release_backlog().await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert!(stored.lock.is_none());
        assert!(stored.is_acquirable(clock.now()));
    }

    #[tokio::test]
    async fn expired_lease_is_picked_up_by_another_engine() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        store
            .insert(Job::new_async("work", serde_json::json!({}), clock.now()))
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(JobHandlers::new());
        let counter = runs.clone();
        handlers.register_fn("work", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        // Engine A locks the job and "crashes" (never submits it anywhere).
        let lease = chrono::Duration::seconds(60);
        let snapshot = store.find_acquirable(clock.now(), 1).await.unwrap().pop().unwrap();
        store
            .try_lock(
                snapshot.id,
                ExpectedVersion::Exact(snapshot.version),
                LockToken::new(LockOwner::new("engine-a"), clock.now() + lease),
                clock.now(),
            )
            .await
            .unwrap()
            .unwrap();

        let p = pool(store.clone(), handlers, clock.clone(), 4);
        let mut engine_b = AcquisitionLoop::new(store.clone(), p.clone(), clock.clone(), LockOwner::new("engine-b"), config());

        assert_eq!(engine_b.run_cycle().await.unwrap().acquired, 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(engine_b.run_cycle().await.unwrap().acquired, 1);
        assert!(p.drain(Duration::from_secs(5)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(store.get(snapshot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let store = InMemoryJobStore::arc();
        let clock = SystemClock::shared();
        let p = pool(store.clone(), Arc::new(JobHandlers::new()), clock.clone(), 1);
        let acq = AcquisitionLoop::new(store, p, clock, LockOwner::new("a"), config());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(acq.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("acquisition loop did not stop")
            .unwrap();
    }
}
