//! Job storage boundary and the in-memory implementation.
//!
//! All lock transitions are compare-and-swap operations inside the store, so
//! several executors (or engine instances sharing a database) can poll the
//! same table without in-process coordination.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flowforge_core::{ExpectedVersion, JobId, LockOwner};

use super::types::{DeadLetterEntry, FailureOutcome, Job, JobKind, JobState, LockToken};

/// Shared handle to a job store.
pub type SharedJobStore = Arc<dyn JobStore>;

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a live (not dead-lettered) job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Snapshot of up to `limit` acquirable jobs, oldest due first.
    ///
    /// Candidates are not locked; callers must follow up with [`JobStore::try_lock`].
    async fn find_acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Lock a job if it is still acquirable and at `expected` version.
    ///
    /// Returns `None` when the race was lost (another owner got it first).
    async fn try_lock(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        token: LockToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Extend the lease held by `token`. Returns `false` if the lease is gone.
    async fn renew_lock(
        &self,
        job_id: JobId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Release the lease held by `token` without recording an attempt.
    async fn release_lock(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError>;

    /// Delete a successfully executed job. Returns `false` if the lease is gone.
    async fn complete(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError>;

    /// Record a failed attempt (retry or dead-letter).
    ///
    /// Returns the updated job, or `None` if the lease is gone.
    async fn record_failure(
        &self,
        job_id: JobId,
        token: &LockToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Snapshot of up to `limit` timers whose due time has arrived.
    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Turn a due timer into an executable job. Returns `false` on a lost race.
    async fn promote_timer(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// List live jobs matching a query, ordered by due time.
    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError>;

    /// List dead-lettered jobs, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to executable with a fresh retry budget.
    async fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Delete a dead-lettered job.
    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Purge a live job regardless of its lease.
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Job statistics at `now` (expired leases count as unlocked).
    async fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job record: {0}")]
    InvalidRecord(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub handler_type: Option<String>,
    pub limit: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            state: None,
            kind: None,
            handler_type: None,
            limit: 100,
        }
    }
}

impl JobQuery {
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| job.state == s)
            && self.kind.is_none_or(|k| job.kind == k)
            && self
                .handler_type
                .as_deref()
                .is_none_or(|h| job.handler_type == h)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub timers: usize,
    pub executable: usize,
    pub locked: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
}

/// In-memory job store for tests/dev.
///
/// One `RwLock` guards both tables; every trait call is one critical section,
/// which gives the same atomicity a row-level transaction would.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

fn held_job<'a>(
    tables: &'a mut Tables,
    job_id: JobId,
    token: &LockToken,
) -> Option<&'a mut Job> {
    tables
        .jobs
        .get_mut(&job_id)
        .filter(|job| job.is_held_by(token))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) || tables.dead_letters.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn find_acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut candidates: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();

        candidates.sort_by_key(|j| (j.due_at, j.created_at));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn try_lock(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        token: LockToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !expected.matches(job.version) || !job.is_acquirable(now) {
            return Ok(None);
        }

        job.lock = Some(token);
        job.version += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn renew_lock(
        &self,
        job_id: JobId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = held_job(&mut tables, job_id, token) else {
            return Ok(false);
        };
        if let Some(lock) = job.lock.as_mut() {
            lock.expires_at = expires_at;
        }
        job.version += 1;
        Ok(true)
    }

    async fn release_lock(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = held_job(&mut tables, job_id, token) else {
            return Ok(false);
        };
        job.lock = None;
        job.version += 1;
        Ok(true)
    }

    async fn complete(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        if held_job(&mut tables, job_id, token).is_none() {
            return Ok(false);
        }
        tables.jobs.remove(&job_id);
        Ok(true)
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        token: &LockToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = held_job(&mut tables, job_id, token) else {
            return Ok(None);
        };
        job.apply_failure(&outcome, now);
        let updated = job.clone();

        if updated.state == JobState::DeadLettered {
            tables.jobs.remove(&job_id);
            tables.dead_letters.insert(
                job_id,
                DeadLetterEntry::new(updated.clone(), outcome.error().to_string(), now),
            );
        }
        Ok(Some(updated))
    }

    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.is_due_timer(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn promote_timer(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !expected.matches(job.version) || !job.is_due_timer(now) {
            return Ok(false);
        }
        job.state = JobState::Executable;
        job.version += 1;
        job.updated_at = now;
        Ok(true)
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .chain(tables.dead_letters.values().map(|e| &e.job))
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.due_at, j.created_at));
        result.truncate(query.limit);
        Ok(result)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables.dead_letters.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let entry = tables
            .dead_letters
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.state = JobState::Executable;
        job.retries = 0;
        job.lock = None;
        job.due_at = now;
        job.version += 1;
        job.updated_at = now;

        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        tables
            .dead_letters
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        tables
            .jobs
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let tables = self.read()?;
        let mut stats = JobStats {
            dead_lettered: tables.dead_letters.len(),
            ..JobStats::default()
        };

        for job in tables.jobs.values() {
            match job.state {
                JobState::Timer => stats.timers += 1,
                JobState::Executable if job.is_locked(now) => stats.locked += 1,
                JobState::Executable => stats.executable += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
            }
        }

        Ok(stats)
    }
}
