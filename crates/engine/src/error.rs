use flowforge_core::DomainError;
use flowforge_infra::cache::CacheError;
use flowforge_infra::content::ContentError;
use flowforge_infra::definitions::DefinitionError;
use flowforge_infra::jobs::JobStoreError;

use crate::config::ConfigError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine and its service facades.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("service not available: {0}")]
    ServiceUnavailable(&'static str),

    #[error("configurator '{name}' failed: {reason}")]
    Configurator { name: String, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

impl EngineError {
    pub fn configurator(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Configurator {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
