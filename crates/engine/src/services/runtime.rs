use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info};

use flowforge_core::{JobId, ProcessDefinitionId, ProcessInstanceId, SharedClock};
use flowforge_infra::cache::ProcessDefinitionCache;
use flowforge_infra::definitions::{DefinitionError, ProcessDefinition, SharedDefinitionStore};
use flowforge_infra::jobs::{Job, SharedJobStore};

use super::api::{ProcessInstance, RuntimeService};
use crate::error::EngineResult;

/// Handler type of the job that carries a new instance's first step.
pub const START_PROCESS_JOB: &str = "process.start";

/// Runtime service: starting instances and scheduling work goes through the job store.
pub struct EngineRuntimeService {
    jobs: SharedJobStore,
    definitions: SharedDefinitionStore,
    cache: Arc<ProcessDefinitionCache>,
    clock: SharedClock,
}

impl EngineRuntimeService {
    pub fn new(
        jobs: SharedJobStore,
        definitions: SharedDefinitionStore,
        cache: Arc<ProcessDefinitionCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            jobs,
            definitions,
            cache,
            clock,
        }
    }

    async fn start(
        &self,
        definition: &ProcessDefinition,
        business_key: Option<&str>,
        variables: Value,
    ) -> EngineResult<ProcessInstance> {
        let now = self.clock.now();
        let instance_id = ProcessInstanceId::new();

        let payload = json!({
            "processInstanceId": instance_id,
            "processDefinitionId": definition.id,
            "processDefinitionKey": definition.key,
            "businessKey": business_key,
            "variables": variables,
        });
        let job = Job::new_async(START_PROCESS_JOB, payload, now)
            .with_process_definition(definition.id)
            .with_process_instance(instance_id);
        let start_job_id = self.jobs.insert(job).await?;

        info!(
            process_instance_id = %instance_id,
            key = %definition.key,
            version = definition.version,
            job_id = %start_job_id,
            "process instance started"
        );

        Ok(ProcessInstance {
            id: instance_id,
            process_definition_id: definition.id,
            process_definition_key: definition.key.clone(),
            business_key: business_key.map(str::to_string),
            started_at: now,
            start_job_id,
        })
    }
}

#[async_trait]
impl RuntimeService for EngineRuntimeService {
    async fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: Value,
    ) -> EngineResult<ProcessInstance> {
        let latest = self
            .definitions
            .latest_by_key(key)
            .await?
            .ok_or_else(|| DefinitionError::UnknownKey(key.to_string()))?;
        let definition = self.cache.get(latest.id).await?;
        self.start(&definition, business_key, variables).await
    }

    async fn start_process_instance_by_id(
        &self,
        id: ProcessDefinitionId,
        business_key: Option<&str>,
        variables: Value,
    ) -> EngineResult<ProcessInstance> {
        let definition = self.cache.get(id).await?;
        self.start(&definition, business_key, variables).await
    }

    async fn enqueue_job(&self, handler_type: &str, payload: Value) -> EngineResult<JobId> {
        let job = Job::new_async(handler_type, payload, self.clock.now());
        let id = self.jobs.insert(job).await?;
        debug!(job_id = %id, handler_type, "async job enqueued");
        Ok(id)
    }

    async fn schedule_timer(
        &self,
        handler_type: &str,
        payload: Value,
        due_at: DateTime<Utc>,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> EngineResult<JobId> {
        let mut job = Job::new_timer(handler_type, payload, due_at, self.clock.now());
        if let Some(instance) = process_instance_id {
            job = job.with_process_instance(instance);
        }
        let id = self.jobs.insert(job).await?;
        debug!(job_id = %id, handler_type, due_at = %due_at, "timer scheduled");
        Ok(id)
    }
}
