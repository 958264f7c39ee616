//! `flowforge-engine` — engine bootstrap and service facades.
//!
//! Properties become a typed [`EngineConfiguration`], configurators run in
//! priority order, and the resulting [`ProcessEngine`] owns the stores, the
//! process-definition cache and the async executor.

pub mod config;
pub mod configurator;
pub mod engine;
pub mod error;
pub mod services;

pub use config::{ConfigError, EngineConfiguration, EngineProperties};
pub use configurator::{
    ConfiguratorRegistry, ContentEngineConfigurator, DmnEngineConfigurator, EngineConfigurator,
    FormEngineConfigurator,
};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, EngineResult};
