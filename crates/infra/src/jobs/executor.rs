//! Execution pool: bounded workers running locked jobs.
//!
//! Each submitted job holds one semaphore permit for the duration of its
//! execution. The handler itself runs on its own task so a panic is reported
//! as a failed attempt instead of tearing down the worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use flowforge_core::SharedClock;

use super::store::{JobStoreError, SharedJobStore};
use super::types::{FailureOutcome, Job, JobResult, LockToken, RetryPolicies, RetryPolicy};

/// Executes one job. The actual process-execution step lives behind this.
///
/// Execution is at-least-once: a job whose lease expires mid-run may execute
/// again elsewhere, so handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> JobResult;
}

struct SyncHandler<F>(F);

#[async_trait]
impl<F> JobHandler for SyncHandler<F>
where
    F: Fn(&Job) -> JobResult + Send + Sync,
{
    async fn execute(&self, job: &Job) -> JobResult {
        (self.0)(job)
    }
}

/// Handler registry keyed by handler type pattern.
///
/// Resolution order: exact match, then `prefix.*` category match (longest
/// prefix wins), then the `*` wildcard.
#[derive(Default)]
pub struct JobHandlers {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("JobHandlers").field("patterns", &patterns).finish()
    }
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a handler type pattern.
    pub fn register(&self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(pattern.into(), handler);
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(SyncHandler(handler)));
    }

    pub fn resolve(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());

        if let Some(h) = handlers.get(handler_type) {
            return Some(h.clone());
        }

        let category = handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let matches = handler_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                matches.then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        handlers.get("*").cloned()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to a job after one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReport {
    /// Handler succeeded; the job record was deleted.
    Completed,
    /// Handler failed; the job runs again at `due_at`.
    Retrying { due_at: DateTime<Utc>, retries: u32 },
    /// Retry budget exhausted.
    DeadLettered { retries: u32 },
    /// The lease expired and the job was taken over; the outcome was dropped.
    LeaseLost,
}

/// Execution pool settings.
#[derive(Debug, Clone)]
pub struct ExecutionPoolConfig {
    /// Maximum concurrently executing jobs
    pub pool_size: usize,
    /// Lease duration granted by the acquisition loop (renewed at half-life)
    pub lock_duration: Duration,
}

impl Default for ExecutionPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            lock_duration: Duration::from_secs(300),
        }
    }
}

/// Bounded worker pool.
pub struct ExecutionPool {
    store: SharedJobStore,
    handlers: Arc<JobHandlers>,
    retry_policies: Arc<RetryPolicies>,
    clock: SharedClock,
    config: ExecutionPoolConfig,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ExecutionPool {
    pub fn new(
        store: SharedJobStore,
        handlers: Arc<JobHandlers>,
        retry_policies: Arc<RetryPolicies>,
        clock: SharedClock,
        config: ExecutionPoolConfig,
    ) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            store,
            handlers,
            retry_policies,
            clock,
            config: ExecutionPoolConfig {
                pool_size,
                ..config
            },
            permits: Arc::new(Semaphore::new(pool_size)),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
            started: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.pool_size
    }

    /// Free worker slots right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity().saturating_sub(self.available_slots())
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.current_running = self.in_flight();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Hand a locked job to a free worker.
    ///
    /// Gives the job back when every worker is busy.
    pub fn try_submit(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(job),
        };

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run_with_permit(job, permit).await;
        });
        Ok(())
    }

    async fn run_with_permit(&self, job: Job, _permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        if let Err(e) = self.execute(job).await {
            error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }
    }

    /// Wait until every worker is idle, up to `timeout`.
    ///
    /// Returns `false` if executions were still running when the timeout hit.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.capacity() as u32;
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    /// Execute one locked job and persist its outcome.
    pub async fn execute(&self, job: Job) -> Result<ExecutionReport, JobStoreError> {
        let Some(token) = job.lock.clone() else {
            warn!(job_id = %job.id, "refusing to execute a job without a lease");
            return Ok(ExecutionReport::LeaseLost);
        };

        let result = match self.handlers.resolve(&job.handler_type) {
            Some(handler) => self.run_handler(handler, &job, &token).await,
            None => {
                warn!(job_id = %job.id, handler_type = %job.handler_type, "no handler for job");
                JobResult::Failure(format!("no handler for job type: {}", job.handler_type))
            }
        };

        let now = self.clock.now();
        let policy = self.retry_policies.for_handler(&job.handler_type);

        let report = match result {
            JobResult::Success => {
                if self.store.complete(job.id, &token).await? {
                    debug!(job_id = %job.id, "job completed");
                    ExecutionReport::Completed
                } else {
                    ExecutionReport::LeaseLost
                }
            }
            JobResult::Failure(error) => {
                let outcome = job.failure_outcome(policy, error, now);
                self.record_failure(&job, &token, outcome, now).await?
            }
            JobResult::RetryAfter(delay) => {
                let outcome = retry_after_outcome(&job, policy, delay, now);
                self.record_failure(&job, &token, outcome, now).await?
            }
        };

        self.update_stats(&report);
        if report == ExecutionReport::LeaseLost {
            warn!(job_id = %job.id, owner = %token.owner, "lease lost before outcome was recorded");
        }
        Ok(report)
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
        token: &LockToken,
    ) -> JobResult {
        let owned = job.clone();
        let mut task = tokio::spawn(async move { handler.execute(&owned).await });

        let renew_every = (self.config.lock_duration / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => JobResult::Failure("job handler panicked".to_string()),
                        Err(e) => JobResult::Failure(format!("job handler aborted: {e}")),
                    };
                }
                _ = ticker.tick() => {
                    let expires_at = self.clock.now()
                        + chrono::Duration::from_std(self.config.lock_duration).unwrap_or_default();
                    match self.store.renew_lock(job.id, token, expires_at).await {
                        Ok(true) => debug!(job_id = %job.id, "lease renewed"),
                        Ok(false) => warn!(job_id = %job.id, "lease could not be renewed"),
                        Err(e) => warn!(job_id = %job.id, error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        token: &LockToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<ExecutionReport, JobStoreError> {
        let error = outcome.error().to_string();
        let Some(updated) = self
            .store
            .record_failure(job.id, token, outcome, now)
            .await?
        else {
            return Ok(ExecutionReport::LeaseLost);
        };

        if updated.state.is_terminal() {
            warn!(
                job_id = %job.id,
                handler_type = %job.handler_type,
                retries = updated.retries,
                error = %error,
                "job dead-lettered"
            );
            Ok(ExecutionReport::DeadLettered {
                retries: updated.retries,
            })
        } else {
            debug!(
                job_id = %job.id,
                retries = updated.retries,
                due_at = %updated.due_at,
                error = %error,
                "job failed, retry scheduled"
            );
            Ok(ExecutionReport::Retrying {
                due_at: updated.due_at,
                retries: updated.retries,
            })
        }
    }

    fn update_stats(&self, report: &ExecutionReport) {
        let Ok(mut s) = self.stats.lock() else {
            return;
        };
        s.jobs_processed += 1;
        match report {
            ExecutionReport::Completed => s.jobs_succeeded += 1,
            ExecutionReport::Retrying { .. } => s.jobs_failed += 1,
            ExecutionReport::DeadLettered { .. } => {
                s.jobs_failed += 1;
                s.jobs_dead_lettered += 1;
            }
            ExecutionReport::LeaseLost => s.leases_lost += 1,
        }
    }
}

/// A handler-requested delay still consumes one attempt of the budget.
fn retry_after_outcome(
    job: &Job,
    policy: &RetryPolicy,
    delay: Duration,
    now: DateTime<Utc>,
) -> FailureOutcome {
    let error = "retry requested by handler".to_string();
    if policy.should_retry(job.retries.saturating_add(1)) {
        FailureOutcome::Retry {
            error,
            due_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    } else {
        FailureOutcome::DeadLetter { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flowforge_core::{Clock, ExpectedVersion, LockOwner, ManualClock, SystemClock};

    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::JobState;

    fn pool_with(
        store: Arc<InMemoryJobStore>,
        handlers: Arc<JobHandlers>,
        policies: RetryPolicies,
        clock: SharedClock,
    ) -> Arc<ExecutionPool> {
        Arc::new(ExecutionPool::new(
            store,
            handlers,
            Arc::new(policies),
            clock,
            ExecutionPoolConfig {
                pool_size: 2,
                lock_duration: Duration::from_secs(60),
            },
        ))
    }

    async fn enqueue_and_lock(store: &InMemoryJobStore, handler_type: &str, now: DateTime<Utc>) -> Job {
        let job = Job::new_async(handler_type, serde_json::json!({}), now);
        let id = store.insert(job.clone()).await.unwrap();
        let token = LockToken::new(LockOwner::new("test"), now + chrono::Duration::seconds(60));
        store
            .try_lock(id, ExpectedVersion::Exact(job.version), token, now)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn resolves_exact_then_category_then_wildcard() {
        let handlers = JobHandlers::new();
        handlers.register_fn("mail.send", |_| JobResult::Success);
        handlers.register_fn("mail.*", |_| JobResult::Failure("category".into()));
        handlers.register_fn("*", |_| JobResult::Failure("wildcard".into()));

        assert!(handlers.resolve("mail.send").is_some());
        assert!(handlers.resolve("mail.digest").is_some());
        assert!(handlers.resolve("mailbox").is_some());
        assert!(JobHandlers::new().resolve("anything").is_none());
    }

    #[tokio::test]
    async fn category_match_requires_a_dot_boundary() {
        let handlers = JobHandlers::new();
        handlers.register_fn("mail.*", |_| JobResult::Success);
        assert!(handlers.resolve("mailbox.open").is_none());

        let job = Job::new_async("mail.digest", serde_json::json!({}), Utc::now());
        let handler = handlers.resolve("mail.digest").unwrap();
        assert_eq!(handler.execute(&job).await, JobResult::Success);
    }

    #[tokio::test]
    async fn successful_job_is_deleted() {
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlers::new());
        handlers.register_fn("test", |_| JobResult::Success);
        let pool = pool_with(store.clone(), handlers, RetryPolicies::default(), SystemClock::shared());

        let job = enqueue_and_lock(&store, "test", Utc::now()).await;
        let report = pool.execute(job.clone()).await.unwrap();

        assert_eq!(report, ExecutionReport::Completed);
        assert!(store.get(job.id).await.unwrap().is_none());
        assert_eq!(pool.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn three_failures_dead_letter_without_a_fourth_attempt() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::arc();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(JobHandlers::new());
        let counter = attempts.clone();
        handlers.register_fn("flaky", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Failure("boom".to_string())
        });
        let policies = RetryPolicies::new(RetryPolicy::fixed(3, Duration::from_secs(5)));
        let pool = pool_with(store.clone(), handlers, policies, clock.clone());

        let mut job = enqueue_and_lock(&store, "flaky", clock.now()).await;
        let job_id = job.id;
        for attempt in 1..=3u32 {
            let report = pool.execute(job).await.unwrap();
            if attempt < 3 {
                assert!(matches!(report, ExecutionReport::Retrying { retries, .. } if retries == attempt));
                clock.advance(Duration::from_secs(6));
                let now = clock.now();
                let candidate = store.find_acquirable(now, 1).await.unwrap().pop().unwrap();
                let token = LockToken::new(LockOwner::new("test"), now + chrono::Duration::seconds(60));
                job = store
                    .try_lock(candidate.id, ExpectedVersion::Exact(candidate.version), token, now)
                    .await
                    .unwrap()
                    .unwrap();
            } else {
                assert_eq!(report, ExecutionReport::DeadLettered { retries: 3 });
                break;
            }
        }

        clock.advance(Duration::from_secs(3600));
        assert!(store.find_acquirable(clock.now(), 10).await.unwrap().is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead[0].job.id, job_id);
        assert_eq!(dead[0].job.state, JobState::DeadLettered);
        assert_eq!(dead[0].job.exception.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn missing_handler_counts_as_failure() {
        let store = InMemoryJobStore::arc();
        let pool = pool_with(
            store.clone(),
            Arc::new(JobHandlers::new()),
            RetryPolicies::new(RetryPolicy::no_retry()),
            SystemClock::shared(),
        );

        let job = enqueue_and_lock(&store, "unknown", Utc::now()).await;
        let report = pool.execute(job).await.unwrap();
        assert_eq!(report, ExecutionReport::DeadLettered { retries: 1 });
        let dead = store.list_dead_letters(1).await.unwrap();
        assert!(dead[0].reason.contains("no handler"));
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_as_failure() {
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlers::new());
        handlers.register_fn("explode", |_| panic!("kaboom"));
        let pool = pool_with(
            store.clone(),
            handlers,
            RetryPolicies::new(RetryPolicy::fixed(2, Duration::from_secs(1))),
            SystemClock::shared(),
        );

        let job = enqueue_and_lock(&store, "explode", Utc::now()).await;
        let report = pool.execute(job.clone()).await.unwrap();
        assert!(matches!(report, ExecutionReport::Retrying { retries: 1, .. }));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.exception.as_deref(), Some("job handler panicked"));
    }

    #[tokio::test]
    async fn retry_after_uses_the_handler_delay() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlers::new());
        handlers.register_fn("later", |_| JobResult::RetryAfter(Duration::from_secs(42)));
        let pool = pool_with(store.clone(), handlers, RetryPolicies::default(), clock.clone());

        let job = enqueue_and_lock(&store, "later", clock.now()).await;
        let report = pool.execute(job).await.unwrap();
        let expected = clock.now() + chrono::Duration::seconds(42);
        assert_eq!(report, ExecutionReport::Retrying { due_at: expected, retries: 1 });
    }

    #[tokio::test]
    async fn try_submit_gives_the_job_back_when_saturated() {
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlers::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        struct Blocking(Arc<tokio::sync::Notify>);
        #[async_trait]
        impl JobHandler for Blocking {
            async fn execute(&self, _job: &Job) -> JobResult {
                self.0.notified().await;
                JobResult::Success
            }
        }
        handlers.register("slow", Arc::new(Blocking(gate.clone())));
        let pool = pool_with(store.clone(), handlers, RetryPolicies::default(), SystemClock::shared());

        let now = Utc::now();
        for _ in 0..2 {
            let job = enqueue_and_lock(&store, "slow", now).await;
            assert!(pool.try_submit(job).is_ok());
        }
        assert_eq!(pool.in_flight(), 2);

        let extra = enqueue_and_lock(&store, "slow", now).await;
        let returned = pool.try_submit(extra.clone()).unwrap_err();
        assert_eq!(returned.id, extra.id);

        gate.notify_waiters();
        // Waiters registered later need another wake-up
        for _ in 0..10 {
            gate.notify_waiters();
            if pool.drain(Duration::from_millis(50)).await {
                break;
            }
        }
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_handler_keeps_its_lease_past_the_lock_duration() {
        struct Sleepy;
        #[async_trait]
        impl JobHandler for Sleepy {
            async fn execute(&self, _job: &Job) -> JobResult {
                tokio::time::sleep(Duration::from_millis(400)).await;
                JobResult::Success
            }
        }

        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlers::new());
        handlers.register("slow", Arc::new(Sleepy));
        let pool = Arc::new(ExecutionPool::new(
            store.clone(),
            handlers,
            Arc::new(RetryPolicies::default()),
            SystemClock::shared(),
            ExecutionPoolConfig {
                pool_size: 1,
                lock_duration: Duration::from_millis(100),
            },
        ));

        let now = Utc::now();
        let job = Job::new_async("slow", serde_json::json!({}), now);
        let id = store.insert(job.clone()).await.unwrap();
        let token = LockToken::new(LockOwner::new("test"), now + chrono::Duration::milliseconds(100));
        let job = store
            .try_lock(id, ExpectedVersion::Exact(job.version), token, now)
            .await
            .unwrap()
            .unwrap();

        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.execute(job).await }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.find_acquirable(Utc::now(), 10).await.unwrap().is_empty());
        assert!(store.get(id).await.unwrap().is_some());

        let report = running.await.unwrap().unwrap();
        assert_eq!(report, ExecutionReport::Completed);
        assert!(store.get(id).await.unwrap().is_none());
    }
}
