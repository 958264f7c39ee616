//! Sub-engine configurators.
//!
//! A configurator gets two hooks during bootstrap: `before_init` may adjust the
//! typed configuration before any store or executor is built, and `configure`
//! registers service handles once the core services exist. Configurators run
//! in ascending priority; ties keep registration order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use flowforge_core::{Clock, SystemClock};
use flowforge_infra::content::FsContentStore;

use crate::config::{ConfigError, EngineConfiguration};
use crate::error::{EngineError, EngineResult};
use crate::services::{
    ContentService, DmnRepositoryService, DmnRuleService, FormRepositoryService, FormService,
    FsContentService, ServiceRegistry,
};

pub const DMN_ENGINE_PRIORITY: i32 = 200;
pub const FORM_ENGINE_PRIORITY: i32 = 300;
pub const CONTENT_ENGINE_PRIORITY: i32 = 400;

#[async_trait]
pub trait EngineConfigurator: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn before_init(&self, _config: &mut EngineConfiguration) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn configure(
        &self,
        services: &mut ServiceRegistry,
        config: &EngineConfiguration,
    ) -> EngineResult<()>;
}

/// Registered configurators, kept in invocation order.
#[derive(Default)]
pub struct ConfiguratorRegistry {
    configurators: Vec<Arc<dyn EngineConfigurator>>,
}

impl std::fmt::Debug for ConfiguratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ConfiguratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, configurator: Arc<dyn EngineConfigurator>) {
        self.configurators.push(configurator);
        // stable: equal priorities keep registration order
        self.configurators.sort_by_key(|c| c.priority());
    }

    pub fn len(&self) -> usize {
        self.configurators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurators.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.configurators.iter().map(|c| c.name()).collect()
    }

    pub fn before_init(&self, config: &mut EngineConfiguration) -> Result<(), ConfigError> {
        for configurator in &self.configurators {
            debug!(configurator = configurator.name(), "before_init");
            configurator.before_init(config)?;
        }
        Ok(())
    }

    pub async fn configure(
        &self,
        services: &mut ServiceRegistry,
        config: &EngineConfiguration,
    ) -> EngineResult<()> {
        for configurator in &self.configurators {
            configurator.configure(services, config).await?;
            info!(
                configurator = configurator.name(),
                priority = configurator.priority(),
                "configurator applied"
            );
        }
        Ok(())
    }
}

/// Registers the form repository and form services of an embedded form engine.
pub struct FormEngineConfigurator {
    repository: Arc<dyn FormRepositoryService>,
    forms: Arc<dyn FormService>,
}

impl FormEngineConfigurator {
    pub fn new(repository: Arc<dyn FormRepositoryService>, forms: Arc<dyn FormService>) -> Self {
        Self { repository, forms }
    }
}

#[async_trait]
impl EngineConfigurator for FormEngineConfigurator {
    fn name(&self) -> &str {
        "form-engine"
    }

    fn priority(&self) -> i32 {
        FORM_ENGINE_PRIORITY
    }

    async fn configure(
        &self,
        services: &mut ServiceRegistry,
        _config: &EngineConfiguration,
    ) -> EngineResult<()> {
        services.register::<dyn FormRepositoryService>(self.repository.clone());
        services.register::<dyn FormService>(self.forms.clone());
        Ok(())
    }
}

/// Registers the repository and rule services of an embedded DMN engine.
pub struct DmnEngineConfigurator {
    repository: Arc<dyn DmnRepositoryService>,
    rules: Arc<dyn DmnRuleService>,
}

impl DmnEngineConfigurator {
    pub fn new(repository: Arc<dyn DmnRepositoryService>, rules: Arc<dyn DmnRuleService>) -> Self {
        Self { repository, rules }
    }
}

#[async_trait]
impl EngineConfigurator for DmnEngineConfigurator {
    fn name(&self) -> &str {
        "dmn-engine"
    }

    fn priority(&self) -> i32 {
        DMN_ENGINE_PRIORITY
    }

    async fn configure(
        &self,
        services: &mut ServiceRegistry,
        _config: &EngineConfiguration,
    ) -> EngineResult<()> {
        services.register::<dyn DmnRepositoryService>(self.repository.clone());
        services.register::<dyn DmnRuleService>(self.rules.clone());
        Ok(())
    }
}

/// Opens the filesystem content store and registers the content service.
#[derive(Debug, Default)]
pub struct ContentEngineConfigurator {
    root_folder: Option<PathBuf>,
}

impl ContentEngineConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `contentstorage.fs.rootFolder`.
    pub fn with_root_folder(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_folder = Some(root.into());
        self
    }
}

#[async_trait]
impl EngineConfigurator for ContentEngineConfigurator {
    fn name(&self) -> &str {
        "content-engine"
    }

    fn priority(&self) -> i32 {
        CONTENT_ENGINE_PRIORITY
    }

    fn before_init(&self, config: &mut EngineConfiguration) -> Result<(), ConfigError> {
        if let Some(root) = &self.root_folder {
            config.content.root_folder = root.clone();
        }
        Ok(())
    }

    async fn configure(
        &self,
        services: &mut ServiceRegistry,
        config: &EngineConfiguration,
    ) -> EngineResult<()> {
        let store = FsContentStore::open(&config.content.root_folder, config.content.create_root)
            .await
            .map_err(|e| EngineError::configurator(self.name(), e))?;
        let clock = services
            .get::<dyn Clock>()
            .unwrap_or_else(SystemClock::shared);

        info!(root = %store.root().display(), "content storage ready");
        services.register::<dyn ContentService>(Arc::new(FsContentService::new(store, clock)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recording {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EngineConfigurator for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn before_init(&self, config: &mut EngineConfiguration) -> Result<(), ConfigError> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            config.engine_name = self.name.to_string();
            Ok(())
        }

        async fn configure(
            &self,
            _services: &mut ServiceRegistry,
            _config: &EngineConfiguration,
        ) -> EngineResult<()> {
            self.log.lock().unwrap().push(format!("configure:{}", self.name));
            Ok(())
        }
    }

    fn recording(name: &'static str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recording> {
        Arc::new(Recording {
            name,
            priority,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn hooks_run_in_priority_order_with_stable_ties() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConfiguratorRegistry::new();
        registry.register(recording("content", 400, &log));
        registry.register(recording("first-tie", 10, &log));
        registry.register(recording("dmn", 200, &log));
        registry.register(recording("second-tie", 10, &log));

        assert_eq!(registry.names(), vec!["first-tie", "second-tie", "dmn", "content"]);

        let mut config = EngineConfiguration::default();
        registry.before_init(&mut config).unwrap();
        // last hook wins
        assert_eq!(config.engine_name, "content");

        let mut services = ServiceRegistry::new();
        registry.configure(&mut services, &config).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "init:first-tie",
                "init:second-tie",
                "init:dmn",
                "init:content",
                "configure:first-tie",
                "configure:second-tie",
                "configure:dmn",
                "configure:content",
            ]
        );
    }

    #[tokio::test]
    async fn content_configurator_registers_the_service() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("content");
        let configurator = ContentEngineConfigurator::new().with_root_folder(&root);

        let mut config = EngineConfiguration::default();
        configurator.before_init(&mut config).unwrap();
        assert_eq!(config.content.root_folder, root);

        let mut services = ServiceRegistry::new();
        configurator.configure(&mut services, &config).await.unwrap();
        assert!(services.contains::<dyn ContentService>());
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn content_configurator_fails_on_missing_root_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfiguration::default();
        config.content.root_folder = dir.path().join("absent");
        config.content.create_root = false;

        let mut services = ServiceRegistry::new();
        let err = ContentEngineConfigurator::new()
            .configure(&mut services, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configurator { ref name, .. } if name == "content-engine"));
        assert!(!services.contains::<dyn ContentService>());
    }
}
