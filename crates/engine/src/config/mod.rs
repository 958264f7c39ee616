//! Engine configuration.
//!
//! [`EngineProperties`] is the raw environment; [`EngineConfiguration`] is the
//! typed, validated result that the bootstrap consumes.

pub mod engine;
pub mod keys;
pub mod properties;

pub use engine::{ContentConfig, DatabaseConfig, EngineConfiguration, MailConfig};
pub use properties::EngineProperties;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required property '{0}' is not set")]
    MissingProperty(String),

    #[error("invalid value '{value}' for property '{key}': {reason}")]
    InvalidProperty {
        key: String,
        value: String,
        reason: String,
    },
}
