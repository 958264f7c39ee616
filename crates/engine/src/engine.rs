//! Engine bootstrap and the service facade handle.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use flowforge_core::{Clock, SharedClock, SystemClock};
use flowforge_infra::cache::ProcessDefinitionCache;
use flowforge_infra::definitions::{
    InMemoryDefinitionStore, PostgresDefinitionStore, SharedDefinitionStore,
};
use flowforge_infra::jobs::{
    AsyncExecutor, InMemoryJobStore, Job, JobHandler, JobHandlers, JobResult, PostgresJobStore,
    RetryPolicies, RetryPolicy, SharedJobStore, ShutdownReport,
};

use crate::config::{DatabaseConfig, EngineConfiguration, EngineProperties};
use crate::configurator::{ConfiguratorRegistry, ContentEngineConfigurator, EngineConfigurator};
use crate::error::{EngineError, EngineResult};
use crate::services::{
    ContentService, DmnRepositoryService, DmnRuleService, EngineManagementService,
    EngineRepositoryService, EngineRuntimeService, FormRepositoryService, FormService,
    HistoryService, IdentityService, IdmIdentityService, ManagementService, RepositoryService,
    RuntimeService, ServiceRegistry, TaskService,
};

/// Assembles a [`ProcessEngine`] from properties, configurators and overrides.
pub struct ProcessEngineBuilder {
    properties: EngineProperties,
    configurators: ConfiguratorRegistry,
    clock: Option<SharedClock>,
    handlers: Arc<JobHandlers>,
    retry_overrides: Vec<(String, RetryPolicy)>,
    job_store: Option<SharedJobStore>,
    definition_store: Option<SharedDefinitionStore>,
    services: ServiceRegistry,
}

impl ProcessEngineBuilder {
    pub fn new(properties: EngineProperties) -> Self {
        Self {
            properties,
            configurators: ConfiguratorRegistry::new(),
            clock: None,
            handlers: Arc::new(JobHandlers::new()),
            retry_overrides: Vec::new(),
            job_store: None,
            definition_store: None,
            services: ServiceRegistry::new(),
        }
    }

    pub fn configurator(mut self, configurator: Arc<dyn EngineConfigurator>) -> Self {
        self.configurators.register(configurator);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn handler(self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.register(pattern, handler);
        self
    }

    pub fn handler_fn<F>(self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.register_fn(pattern, handler);
        self
    }

    /// Retry policy for one handler type; others use the configured default.
    pub fn retry_policy(mut self, handler_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_overrides.push((handler_type.into(), policy));
        self
    }

    /// Use this job store instead of the one selected by `database.url`.
    pub fn job_store(mut self, store: SharedJobStore) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn definition_store(mut self, store: SharedDefinitionStore) -> Self {
        self.definition_store = Some(store);
        self
    }

    /// Pre-register an externally supplied service handle
    /// (`TaskService`, `HistoryService`, ...).
    pub fn service<S>(mut self, service: Arc<S>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.services.register::<S>(service);
        self
    }

    pub async fn build(self) -> EngineResult<ProcessEngine> {
        let Self {
            properties,
            configurators,
            clock,
            handlers,
            retry_overrides,
            job_store,
            definition_store,
            mut services,
        } = self;

        let mut config = EngineConfiguration::from_properties(&properties)?;
        configurators.before_init(&mut config)?;

        let clock = clock.unwrap_or_else(SystemClock::shared);
        let (jobs, definitions) = match (job_store, definition_store) {
            (Some(jobs), Some(definitions)) => (jobs, definitions),
            (jobs, definitions) => {
                let (default_jobs, default_definitions) = open_stores(&config.database).await?;
                (
                    jobs.unwrap_or(default_jobs),
                    definitions.unwrap_or(default_definitions),
                )
            }
        };

        let cache = Arc::new(ProcessDefinitionCache::new(
            definitions.clone(),
            config.definition_cache_limit,
        ));

        let policies = retry_overrides.into_iter().fold(
            RetryPolicies::new(config.retry.clone()),
            |policies, (handler_type, policy)| policies.with_policy(handler_type, policy),
        );
        let executor = Arc::new(AsyncExecutor::new(
            jobs.clone(),
            handlers,
            Arc::new(policies),
            clock.clone(),
            config.async_executor.clone(),
        ));

        services.register::<dyn Clock>(clock.clone());
        services.register::<dyn RepositoryService>(Arc::new(EngineRepositoryService::new(
            definitions.clone(),
            cache.clone(),
            clock.clone(),
            config.safe_xml,
        )));
        services.register::<dyn RuntimeService>(Arc::new(EngineRuntimeService::new(
            jobs.clone(),
            definitions.clone(),
            cache.clone(),
            clock.clone(),
        )));
        services.register::<dyn ManagementService>(Arc::new(EngineManagementService::new(
            jobs.clone(),
            executor.clone(),
            cache.clone(),
            clock.clone(),
        )));

        configurators.configure(&mut services, &config).await?;

        if config.async_executor_activate {
            executor.start();
        }

        info!(
            engine = %config.engine_name,
            configurators = configurators.len(),
            services = services.len(),
            persistent = config.database.url.is_some(),
            executor_active = executor.is_active(),
            "process engine built"
        );

        Ok(ProcessEngine {
            config,
            clock,
            jobs,
            definitions,
            cache,
            executor,
            services,
        })
    }
}

async fn open_stores(
    database: &DatabaseConfig,
) -> EngineResult<(SharedJobStore, SharedDefinitionStore)> {
    let Some(url) = database.url.as_deref() else {
        info!("no database.url set; using in-memory stores");
        let jobs: SharedJobStore = InMemoryJobStore::arc();
        let definitions: SharedDefinitionStore = InMemoryDefinitionStore::arc();
        return Ok((jobs, definitions));
    };

    let pool = PgPool::connect(url)
        .await
        .map_err(|e| EngineError::Database(e.to_string()))?;
    let jobs = PostgresJobStore::new(pool.clone());
    let definitions = PostgresDefinitionStore::new(pool);

    if database.schema_update {
        jobs.ensure_schema().await?;
        definitions.ensure_schema().await?;
        info!("database schema ensured");
    }

    let jobs: SharedJobStore = Arc::new(jobs);
    let definitions: SharedDefinitionStore = Arc::new(definitions);
    Ok((jobs, definitions))
}

/// A running engine: configuration, stores, definition cache, async executor
/// and the registered service facades.
pub struct ProcessEngine {
    config: EngineConfiguration,
    clock: SharedClock,
    jobs: SharedJobStore,
    definitions: SharedDefinitionStore,
    cache: Arc<ProcessDefinitionCache>,
    executor: Arc<AsyncExecutor>,
    services: ServiceRegistry,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("name", &self.config.engine_name)
            .field("executor", &self.executor)
            .field("services", &self.services)
            .finish()
    }
}

impl ProcessEngine {
    pub fn builder(properties: EngineProperties) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(properties)
    }

    /// Boot from the process environment with the content configurator.
    pub async fn from_env() -> EngineResult<Self> {
        Self::builder(EngineProperties::from_env())
            .configurator(Arc::new(ContentEngineConfigurator::new()))
            .build()
            .await
    }

    pub fn name(&self) -> &str {
        &self.config.engine_name
    }

    pub fn configuration(&self) -> &EngineConfiguration {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn job_store(&self) -> &SharedJobStore {
        &self.jobs
    }

    pub fn definition_store(&self) -> &SharedDefinitionStore {
        &self.definitions
    }

    pub fn definition_cache(&self) -> &Arc<ProcessDefinitionCache> {
        &self.cache
    }

    pub fn async_executor(&self) -> &Arc<AsyncExecutor> {
        &self.executor
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Handlers may be registered while the executor runs.
    pub fn register_handler(&self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.executor.register_handler(pattern, handler);
    }

    pub fn service<S>(&self, name: &'static str) -> EngineResult<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.services
            .get::<S>()
            .ok_or(EngineError::ServiceUnavailable(name))
    }

    pub fn repository_service(&self) -> EngineResult<Arc<dyn RepositoryService>> {
        self.service("repository")
    }

    pub fn runtime_service(&self) -> EngineResult<Arc<dyn RuntimeService>> {
        self.service("runtime")
    }

    pub fn task_service(&self) -> EngineResult<Arc<dyn TaskService>> {
        self.service("task")
    }

    pub fn history_service(&self) -> EngineResult<Arc<dyn HistoryService>> {
        self.service("history")
    }

    pub fn form_service(&self) -> EngineResult<Arc<dyn FormService>> {
        self.service("form")
    }

    pub fn identity_service(&self) -> EngineResult<Arc<dyn IdentityService>> {
        self.service("identity")
    }

    pub fn idm_identity_service(&self) -> EngineResult<Arc<dyn IdmIdentityService>> {
        self.service("idm-identity")
    }

    pub fn management_service(&self) -> EngineResult<Arc<dyn ManagementService>> {
        self.service("management")
    }

    pub fn form_repository_service(&self) -> EngineResult<Arc<dyn FormRepositoryService>> {
        self.service("form-repository")
    }

    pub fn dmn_repository_service(&self) -> EngineResult<Arc<dyn DmnRepositoryService>> {
        self.service("dmn-repository")
    }

    pub fn dmn_rule_service(&self) -> EngineResult<Arc<dyn DmnRuleService>> {
        self.service("dmn-rule")
    }

    pub fn content_service(&self) -> EngineResult<Arc<dyn ContentService>> {
        self.service("content")
    }

    /// Stop the async executor, waiting up to the configured shutdown timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self
            .executor
            .shutdown(self.config.async_executor.shutdown_timeout)
            .await;
        info!(
            engine = %self.config.engine_name,
            drained = report.drained,
            abandoned = report.abandoned,
            "process engine stopped"
        );
        report
    }
}
