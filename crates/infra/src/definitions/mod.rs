//! Process definitions: deployment parsing and storage.

pub mod model;
pub mod postgres;
pub mod store;

pub use model::{ProcessDefinition, ProcessOutline, parse_outline};
pub use postgres::PostgresDefinitionStore;
pub use store::{InMemoryDefinitionStore, ProcessDefinitionStore, SharedDefinitionStore};

use flowforge_core::ProcessDefinitionId;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid process definition: {0}")]
    Invalid(String),

    #[error("unsafe XML rejected: document contains {0}")]
    UnsafeXml(String),

    #[error("process definition not found: {0}")]
    NotFound(ProcessDefinitionId),

    #[error("no process definition deployed for key '{0}'")]
    UnknownKey(String),

    #[error("definition storage error: {0}")]
    Storage(String),
}
