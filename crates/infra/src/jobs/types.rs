//! Core job types and policies.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowforge_core::{CorrelationId, JobId, LockOwner, ProcessDefinitionId, ProcessInstanceId};

/// Origin of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Enqueued by a running execution step (continue asynchronously).
    AsyncMessage,
    /// Created from a timer construct (boundary event, intermediate delay).
    Timer,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AsyncMessage => "async_message",
            JobKind::Timer => "timer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "async_message" => Some(Self::AsyncMessage),
            "timer" => Some(Self::Timer),
            _ => None,
        }
    }
}

/// Storage state of a job.
///
/// Completed jobs are deleted, so there is no `Completed` state. A locked job
/// is an `Executable` job carrying a [`LockToken`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Timer not yet promoted by the timer sweep.
    Timer,
    /// Acquirable once due and unlocked.
    Executable,
    /// Exhausted its retry budget.
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Timer => "timer",
            JobState::Executable => "executable",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "timer" => Some(Self::Timer),
            "executable" => Some(Self::Executable),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::DeadLettered)
    }
}

/// Time-bounded exclusive claim on a job (a lease).
///
/// The `lease` id distinguishes two consecutive claims by the same owner, so a
/// worker whose lease expired cannot complete a job re-acquired afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: LockOwner,
    pub lease: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(owner: LockOwner, expires_at: DateTime<Utc>) -> Self {
        Self {
            owner,
            lease: Uuid::now_v7(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Same claim (owner and lease), regardless of renewals.
    pub fn same_lease(&self, other: &LockToken) -> bool {
        self.owner == other.owner && self.lease == other.lease
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed before dead-lettering (0 and 1 both mean "no retries")
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0), spread symmetrically around the delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retrying after the given failure count (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, 0)
    }

    /// Delay with jitter derived from `seed`, so jobs failing together spread
    /// out instead of retrying in lockstep.
    pub fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let mixed = seed
                .wrapping_add(attempt as u64)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let unit = ((mixed >> 11) % 10_000) as f64 / 10_000.0;
            jitter_range * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Retry policies keyed by job handler type, with a fallback default.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_handler: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_handler: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, handler_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.by_handler.insert(handler_type.into(), policy);
        self
    }

    pub fn for_handler(&self, handler_type: &str) -> &RetryPolicy {
        self.by_handler.get(handler_type).unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }
}

/// A unit of deferred or asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Routing key used to pick a handler
    pub handler_type: String,
    /// JSON payload passed to the handler
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Earliest time the job may run
    pub due_at: DateTime<Utc>,
    /// Current lease, if any (may be expired)
    pub lock: Option<LockToken>,
    /// Number of failed attempts so far
    pub retries: u32,
    /// Error recorded by the last failed attempt
    pub exception: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub process_definition_id: Option<ProcessDefinitionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    /// Bumped on every mutation; used for compare-and-swap
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// An async job, due immediately.
    pub fn new_async(
        handler_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(JobKind::AsyncMessage, JobState::Executable, handler_type, payload, now, now)
    }

    /// A timer job firing at `due_at`.
    pub fn new_timer(
        handler_type: impl Into<String>,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(JobKind::Timer, JobState::Timer, handler_type, payload, due_at, now)
    }

    fn new(
        kind: JobKind,
        state: JobState,
        handler_type: impl Into<String>,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            handler_type: handler_type.into(),
            payload,
            state,
            due_at,
            lock: None,
            retries: 0,
            exception: None,
            correlation_id: None,
            process_definition_id: None,
            process_instance_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_process_definition(mut self, id: ProcessDefinitionId) -> Self {
        self.process_definition_id = Some(id);
        self
    }

    pub fn with_process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    /// Delay the job's first run.
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_at = at;
        self
    }

    /// Whether the lease is currently held (present and not expired).
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Executable, due, and not held by a live lease.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Executable && self.due_at <= now && !self.is_locked(now)
    }

    /// Timer whose due time has arrived.
    pub fn is_due_timer(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Timer && self.due_at <= now
    }

    /// Whether `token` is the lease currently recorded on the job.
    pub fn is_held_by(&self, token: &LockToken) -> bool {
        self.lock.as_ref().is_some_and(|l| l.same_lease(token))
    }

    /// Decide what a failed attempt leads to under `policy`.
    pub fn failure_outcome(
        &self,
        policy: &RetryPolicy,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let failures = self.retries.saturating_add(1);
        let error = error.into();
        if policy.should_retry(failures) {
            let seed = self.id.as_uuid().as_u64_pair().1;
            let delay = policy.jittered_delay(failures, seed);
            FailureOutcome::Retry {
                error,
                due_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
            }
        } else {
            FailureOutcome::DeadLetter { error }
        }
    }

    /// Apply a failed attempt: bump the retry count, record the exception,
    /// drop the lease.
    pub fn apply_failure(&mut self, outcome: &FailureOutcome, now: DateTime<Utc>) {
        self.retries = self.retries.saturating_add(1);
        self.lock = None;
        self.version += 1;
        self.updated_at = now;
        match outcome {
            FailureOutcome::Retry { error, due_at } => {
                self.exception = Some(error.clone());
                self.due_at = *due_at;
            }
            FailureOutcome::DeadLetter { error } => {
                self.exception = Some(error.clone());
                self.state = JobState::DeadLettered;
            }
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Release the lease and run again at `due_at`.
    Retry { error: String, due_at: DateTime<Utc> },
    /// Retry budget exhausted.
    DeadLetter { error: String },
}

impl FailureOutcome {
    pub fn error(&self) -> &str {
        match self {
            FailureOutcome::Retry { error, .. } | FailureOutcome::DeadLetter { error } => error,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, FailureOutcome::DeadLetter { .. })
    }
}

/// Result of job execution, returned by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; retried per policy
    Failure(String),
    /// Job should be retried after a delay chosen by the handler
    RetryAfter(Duration),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: at,
            reason,
        }
    }
}
