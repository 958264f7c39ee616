use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use flowforge_core::{JobId, SharedClock};
use flowforge_infra::cache::{CacheStats, ProcessDefinitionCache};
use flowforge_infra::jobs::{
    AsyncExecutor, DeadLetterEntry, ExecutorStats, Job, JobQuery, JobStats, SharedJobStore,
};

use super::api::ManagementService;
use crate::error::EngineResult;

/// Operator view of the job table, the executor and the definition cache.
pub struct EngineManagementService {
    jobs: SharedJobStore,
    executor: Arc<AsyncExecutor>,
    cache: Arc<ProcessDefinitionCache>,
    clock: SharedClock,
}

impl EngineManagementService {
    pub fn new(
        jobs: SharedJobStore,
        executor: Arc<AsyncExecutor>,
        cache: Arc<ProcessDefinitionCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            jobs,
            executor,
            cache,
            clock,
        }
    }
}

#[async_trait]
impl ManagementService for EngineManagementService {
    async fn get_job(&self, id: JobId) -> EngineResult<Option<Job>> {
        Ok(self.jobs.get(id).await?)
    }

    async fn list_jobs(&self, query: &JobQuery) -> EngineResult<Vec<Job>> {
        Ok(self.jobs.list(query).await?)
    }

    async fn list_dead_letter_jobs(&self, limit: usize) -> EngineResult<Vec<DeadLetterEntry>> {
        Ok(self.jobs.list_dead_letters(limit).await?)
    }

    async fn retry_dead_letter_job(&self, id: JobId) -> EngineResult<Job> {
        let job = self.jobs.retry_dead_letter(id, self.clock.now()).await?;
        info!(job_id = %id, handler_type = %job.handler_type, "dead-lettered job requeued");
        Ok(job)
    }

    async fn delete_dead_letter_job(&self, id: JobId) -> EngineResult<()> {
        self.jobs.delete_dead_letter(id).await?;
        info!(job_id = %id, "dead-lettered job deleted");
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> EngineResult<()> {
        self.jobs.delete(id).await?;
        info!(job_id = %id, "job purged");
        Ok(())
    }

    async fn job_stats(&self) -> EngineResult<JobStats> {
        Ok(self.jobs.stats(self.clock.now()).await?)
    }

    fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    fn definition_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
