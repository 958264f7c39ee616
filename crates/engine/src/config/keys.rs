//! Property keys understood by the engine.

pub const ENGINE_NAME: &str = "flowforge.engine.name";

pub const EMAIL_HOST: &str = "email.host";
pub const EMAIL_PORT: &str = "email.port";
pub const EMAIL_USE_CREDENTIALS: &str = "email.useCredentials";
pub const EMAIL_USERNAME: &str = "email.username";
pub const EMAIL_PASSWORD: &str = "email.password";

pub const DEFINITION_CACHE_MAX: &str = "flowforge.process-definitions.cache.max";
pub const SAFE_XML: &str = "flowforge.safe-xml";

pub const CONTENT_ROOT_FOLDER: &str = "contentstorage.fs.rootFolder";
pub const CONTENT_CREATE_ROOT: &str = "contentstorage.fs.createRoot";

pub const ASYNC_EXECUTOR_ACTIVATE: &str = "flowforge.async-executor.activate";
pub const ASYNC_JOB_ACQUIRE_WAIT_MS: &str = "flowforge.async-executor.async-job-acquire-wait-ms";
pub const TIMER_JOB_ACQUIRE_WAIT_MS: &str = "flowforge.async-executor.timer-job-acquire-wait-ms";
pub const CORE_POOL_SIZE: &str = "flowforge.async-executor.core-pool-size";
pub const LOCK_TIME_MS: &str = "flowforge.async-executor.lock-time-ms";
pub const MAX_JOBS_PER_ACQUISITION: &str = "flowforge.async-executor.max-jobs-per-acquisition";
pub const MAX_TIMERS_PER_ACQUISITION: &str = "flowforge.async-executor.max-timers-per-acquisition";
pub const SHUTDOWN_TIMEOUT_MS: &str = "flowforge.async-executor.shutdown-timeout-ms";
pub const NUMBER_OF_RETRIES: &str = "flowforge.async-executor.number-of-retries";
pub const RETRY_WAIT_MS: &str = "flowforge.async-executor.retry-wait-ms";

pub const DATABASE_URL: &str = "database.url";
pub const DATABASE_SCHEMA_UPDATE: &str = "database.schema-update";
