use std::path::PathBuf;
use std::time::Duration;

use flowforge_infra::cache::DEFAULT_DEFINITION_CACHE_LIMIT;
use flowforge_infra::jobs::{AsyncExecutorConfig, RetryPolicy};

use super::properties::EngineProperties;
use super::{ConfigError, keys};

/// Outgoing mail server settings. Delivery itself is not handled here.
#[derive(Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub use_credentials: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_credentials", &self.use_credentials)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentConfig {
    pub root_folder: PathBuf,
    pub create_root: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root_folder: PathBuf::from("flowforge-content"),
            create_root: true,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// `None` runs the engine on in-memory stores
    pub url: Option<String>,
    /// Create missing tables on boot
    pub schema_update: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema_update: true,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<set>"))
            .field("schema_update", &self.schema_update)
            .finish()
    }
}

/// Typed engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfiguration {
    pub engine_name: String,
    pub mail: Option<MailConfig>,
    /// `<= 0` disables eviction
    pub definition_cache_limit: i64,
    /// Reject deployments declaring a DTD or entities
    pub safe_xml: bool,
    pub content: ContentConfig,
    pub async_executor: AsyncExecutorConfig,
    pub async_executor_activate: bool,
    /// Default retry policy for jobs without a per-handler override
    pub retry: RetryPolicy,
    pub database: DatabaseConfig,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            engine_name: "default".to_string(),
            mail: None,
            definition_cache_limit: DEFAULT_DEFINITION_CACHE_LIMIT,
            safe_xml: true,
            content: ContentConfig::default(),
            async_executor: AsyncExecutorConfig::default(),
            async_executor_activate: true,
            retry: RetryPolicy::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl EngineConfiguration {
    pub fn from_properties(props: &EngineProperties) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let executor_defaults = AsyncExecutorConfig::default();

        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(props
                .get_parsed::<u64>(key)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        let async_executor = AsyncExecutorConfig {
            async_job_acquire_wait: millis(
                keys::ASYNC_JOB_ACQUIRE_WAIT_MS,
                executor_defaults.async_job_acquire_wait,
            )?,
            timer_job_acquire_wait: millis(
                keys::TIMER_JOB_ACQUIRE_WAIT_MS,
                executor_defaults.timer_job_acquire_wait,
            )?,
            core_pool_size: props
                .get_parsed_or(keys::CORE_POOL_SIZE, executor_defaults.core_pool_size)?,
            lock_duration: millis(keys::LOCK_TIME_MS, executor_defaults.lock_duration)?,
            max_jobs_per_acquisition: props.get_parsed_or(
                keys::MAX_JOBS_PER_ACQUISITION,
                executor_defaults.max_jobs_per_acquisition,
            )?,
            max_timers_per_acquisition: props.get_parsed_or(
                keys::MAX_TIMERS_PER_ACQUISITION,
                executor_defaults.max_timers_per_acquisition,
            )?,
            shutdown_timeout: millis(keys::SHUTDOWN_TIMEOUT_MS, executor_defaults.shutdown_timeout)?,
            owner_prefix: executor_defaults.owner_prefix,
        };

        if async_executor.core_pool_size == 0 {
            return Err(ConfigError::InvalidProperty {
                key: keys::CORE_POOL_SIZE.to_string(),
                value: "0".to_string(),
                reason: "pool size must be at least 1".to_string(),
            });
        }

        let retry = RetryPolicy {
            max_attempts: props.get_parsed_or(keys::NUMBER_OF_RETRIES, defaults.retry.max_attempts)?,
            base_delay: millis(keys::RETRY_WAIT_MS, defaults.retry.base_delay)?,
            ..defaults.retry
        };

        let content = ContentConfig {
            root_folder: props
                .get_non_empty(keys::CONTENT_ROOT_FOLDER)
                .map(PathBuf::from)
                .unwrap_or(defaults.content.root_folder),
            create_root: props.get_bool_or(keys::CONTENT_CREATE_ROOT, defaults.content.create_root)?,
        };

        let database = DatabaseConfig {
            url: props.get_non_empty(keys::DATABASE_URL).map(str::to_string),
            schema_update: props
                .get_bool_or(keys::DATABASE_SCHEMA_UPDATE, defaults.database.schema_update)?,
        };

        Ok(Self {
            engine_name: props.get_or(keys::ENGINE_NAME, &defaults.engine_name).to_string(),
            mail: mail_from_properties(props)?,
            definition_cache_limit: props
                .get_parsed_or(keys::DEFINITION_CACHE_MAX, defaults.definition_cache_limit)?,
            safe_xml: props.get_bool_or(keys::SAFE_XML, defaults.safe_xml)?,
            content,
            async_executor,
            async_executor_activate: props
                .get_bool_or(keys::ASYNC_EXECUTOR_ACTIVATE, defaults.async_executor_activate)?,
            retry,
            database,
        })
    }
}

/// Mail is configured only when a host is given; the port is then required.
fn mail_from_properties(props: &EngineProperties) -> Result<Option<MailConfig>, ConfigError> {
    let Some(host) = props.get_non_empty(keys::EMAIL_HOST) else {
        return Ok(None);
    };

    let port = props.require_parsed::<u16>(keys::EMAIL_PORT)?;
    let use_credentials = props.get_bool_or(keys::EMAIL_USE_CREDENTIALS, false)?;
    let (username, password) = if use_credentials {
        (
            props.get(keys::EMAIL_USERNAME).map(str::to_string),
            props.get(keys::EMAIL_PASSWORD).map(str::to_string),
        )
    } else {
        (None, None)
    };

    Ok(Some(MailConfig {
        host: host.to_string(),
        port,
        use_credentials,
        username,
        password,
    }))
}
