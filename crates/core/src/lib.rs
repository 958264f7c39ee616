//! `flowforge-core`: shared primitives for the engine crates.
//!
//! Identifiers, the id parse error, optimistic versioning, and the engine
//! clock. No infrastructure concerns live here.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::DomainError;
pub use id::{
    ContentItemId, CorrelationId, DeploymentId, JobId, LockOwner, ProcessDefinitionId,
    ProcessInstanceId,
};
pub use version::ExpectedVersion;
