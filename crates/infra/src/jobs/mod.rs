//! Async job executor with leases, retry/backoff and dead-lettering.
//!
//! ## Design
//!
//! - Jobs live in a shared [`JobStore`]; several engine instances may poll it
//! - Locking is a version compare-and-swap plus a time-bounded lease
//! - Execution is at-least-once: an expired lease makes the job acquirable again
//! - Failures retry with backoff until the policy gives up, then dead-letter
//!
//! ## Components
//!
//! - `AcquisitionLoop`: polls for due jobs and locks a batch
//! - `ExecutionPool`: bounded workers running registered `JobHandler`s
//! - `TimerSweep`: promotes due timers to executable jobs
//! - `AsyncExecutor`: starts and stops the three above

pub mod acquisition;
pub mod async_executor;
pub mod executor;
pub mod postgres;
pub mod store;
pub mod timer;
pub mod types;

pub use acquisition::{AcquisitionConfig, AcquisitionLoop, CycleReport};
pub use async_executor::{AsyncExecutor, AsyncExecutorConfig, ShutdownReport};
pub use executor::{
    ExecutionPool, ExecutionPoolConfig, ExecutionReport, ExecutorStats, JobHandler, JobHandlers,
};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobQuery, JobStats, JobStore, JobStoreError, SharedJobStore};
pub use timer::{SweepReport, TimerSweep, TimerSweepConfig};
pub use types::{
    BackoffStrategy, DeadLetterEntry, FailureOutcome, Job, JobKind, JobResult, JobState,
    LockToken, RetryPolicies, RetryPolicy,
};
