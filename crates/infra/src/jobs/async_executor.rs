//! Async executor: owns the acquisition loop, timer sweep and execution pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use flowforge_core::{LockOwner, SharedClock};

use super::acquisition::{AcquisitionConfig, AcquisitionLoop};
use super::executor::{ExecutionPool, ExecutionPoolConfig, ExecutorStats, JobHandler, JobHandlers};
use super::store::SharedJobStore;
use super::timer::{TimerSweep, TimerSweepConfig};
use super::types::RetryPolicies;

/// Async executor tunables.
#[derive(Debug, Clone)]
pub struct AsyncExecutorConfig {
    pub async_job_acquire_wait: Duration,
    pub timer_job_acquire_wait: Duration,
    pub core_pool_size: usize,
    pub lock_duration: Duration,
    pub max_jobs_per_acquisition: usize,
    pub max_timers_per_acquisition: usize,
    pub shutdown_timeout: Duration,
    /// Lock owner prefix; a random suffix makes each instance unique
    pub owner_prefix: String,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            async_job_acquire_wait: Duration::from_millis(5000),
            timer_job_acquire_wait: Duration::from_millis(5000),
            core_pool_size: 8,
            lock_duration: Duration::from_secs(300),
            max_jobs_per_acquisition: 8,
            max_timers_per_acquisition: 8,
            shutdown_timeout: Duration::from_secs(60),
            owner_prefix: "flowforge".to_string(),
        }
    }
}

impl AsyncExecutorConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    pub fn with_acquire_wait(mut self, wait: Duration) -> Self {
        self.async_job_acquire_wait = wait;
        self
    }

    pub fn with_timer_wait(mut self, wait: Duration) -> Self {
        self.timer_job_acquire_wait = wait;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Result of a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All in-flight executions finished before the timeout
    pub drained: bool,
    /// Executions still running when the timeout hit
    pub abandoned: usize,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    acquisition: JoinHandle<()>,
    timers: JoinHandle<()>,
}

/// Background job execution for one engine instance.
pub struct AsyncExecutor {
    store: SharedJobStore,
    handlers: Arc<JobHandlers>,
    clock: SharedClock,
    pool: Arc<ExecutionPool>,
    owner: LockOwner,
    config: AsyncExecutorConfig,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish()
    }
}

impl AsyncExecutor {
    pub fn new(
        store: SharedJobStore,
        handlers: Arc<JobHandlers>,
        retry_policies: Arc<RetryPolicies>,
        clock: SharedClock,
        config: AsyncExecutorConfig,
    ) -> Self {
        let pool = Arc::new(ExecutionPool::new(
            store.clone(),
            handlers.clone(),
            retry_policies,
            clock.clone(),
            ExecutionPoolConfig {
                pool_size: config.core_pool_size,
                lock_duration: config.lock_duration,
            },
        ));
        let owner = LockOwner::generate(&config.owner_prefix);

        Self {
            store,
            handlers,
            clock,
            pool,
            owner,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn config(&self) -> &AsyncExecutorConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<JobHandlers> {
        &self.handlers
    }

    pub fn register_handler(&self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.register(pattern, handler);
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.pool.stats()
    }

    /// Spawn the acquisition loop and timer sweep. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acquisition = AcquisitionLoop::new(
            self.store.clone(),
            self.pool.clone(),
            self.clock.clone(),
            self.owner.clone(),
            AcquisitionConfig {
                wait: self.config.async_job_acquire_wait,
                lock_duration: self.config.lock_duration,
                max_jobs_per_acquisition: self.config.max_jobs_per_acquisition,
            },
        );
        let timers = TimerSweep::new(
            self.store.clone(),
            self.clock.clone(),
            TimerSweepConfig {
                wait: self.config.timer_job_acquire_wait,
                max_timers_per_acquisition: self.config.max_timers_per_acquisition,
            },
        );

        *running = Some(Running {
            acquisition: tokio::spawn(acquisition.run(shutdown_rx.clone())),
            timers: tokio::spawn(timers.run(shutdown_rx)),
            shutdown_tx,
        });

        info!(
            owner = %self.owner,
            pool_size = self.pool.capacity(),
            "async executor started"
        );
    }

    /// Stop both loops, then wait for in-flight executions.
    ///
    /// Jobs still running after `timeout` finish on their detached tasks. Those
    /// keep renewing the lease and record the outcome once the handler returns.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return ShutdownReport {
                drained: true,
                abandoned: 0,
            };
        };

        info!(owner = %self.owner, "async executor shutting down");
        let _ = running.shutdown_tx.send(true);
        let _ = running.acquisition.await;
        let _ = running.timers.await;

        let drained = self.pool.drain(timeout).await;
        let abandoned = if drained { 0 } else { self.pool.in_flight() };
        if drained {
            info!(owner = %self.owner, "async executor stopped");
        } else {
            warn!(owner = %self.owner, abandoned, "shutdown timeout hit with jobs still running");
        }

        ShutdownReport { drained, abandoned }
    }

    /// [`shutdown`](Self::shutdown) with the configured timeout.
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.config.shutdown_timeout).await
    }
}
