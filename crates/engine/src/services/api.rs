//! Service facades exposed by the process engine.
//!
//! Repository, runtime, management and content services are implemented in
//! this crate. The remaining facades belong to collaborating engines (task
//! execution, history, forms, identity, DMN) and are registered by
//! configurators or by the embedding application.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowforge_core::{ContentItemId, JobId, ProcessDefinitionId, ProcessInstanceId};
use flowforge_infra::cache::CacheStats;
use flowforge_infra::content::{ContentItem, NewContent};
use flowforge_infra::definitions::ProcessDefinition;
use flowforge_infra::jobs::{DeadLetterEntry, ExecutorStats, Job, JobQuery, JobStats};

use crate::error::EngineResult;

/// A started process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: ProcessInstanceId,
    pub process_definition_id: ProcessDefinitionId,
    pub process_definition_key: String,
    pub business_key: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Async job that carries the instance's first step
    pub start_job_id: JobId,
}

#[async_trait]
pub trait RepositoryService: Send + Sync {
    /// Parse and store a BPMN resource as the next version of its process key.
    async fn deploy(&self, resource_name: &str, xml: &str) -> EngineResult<ProcessDefinition>;

    async fn get_process_definition(&self, id: ProcessDefinitionId)
    -> EngineResult<Arc<ProcessDefinition>>;

    async fn get_latest_process_definition(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>>;

    async fn list_process_definitions(&self) -> EngineResult<Vec<ProcessDefinition>>;

    async fn delete_process_definition(&self, id: ProcessDefinitionId) -> EngineResult<()>;
}

#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: Value,
    ) -> EngineResult<ProcessInstance>;

    async fn start_process_instance_by_id(
        &self,
        id: ProcessDefinitionId,
        business_key: Option<&str>,
        variables: Value,
    ) -> EngineResult<ProcessInstance>;

    /// Enqueue an async job for immediate execution.
    async fn enqueue_job(&self, handler_type: &str, payload: Value) -> EngineResult<JobId>;

    /// Schedule a timer job; it becomes executable at `due_at`.
    async fn schedule_timer(
        &self,
        handler_type: &str,
        payload: Value,
        due_at: DateTime<Utc>,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> EngineResult<JobId>;
}

#[async_trait]
pub trait ManagementService: Send + Sync {
    async fn get_job(&self, id: JobId) -> EngineResult<Option<Job>>;

    async fn list_jobs(&self, query: &JobQuery) -> EngineResult<Vec<Job>>;

    async fn list_dead_letter_jobs(&self, limit: usize) -> EngineResult<Vec<DeadLetterEntry>>;

    /// Move a dead-lettered job back to executable with a fresh retry budget.
    async fn retry_dead_letter_job(&self, id: JobId) -> EngineResult<Job>;

    async fn delete_dead_letter_job(&self, id: JobId) -> EngineResult<()>;

    async fn delete_job(&self, id: JobId) -> EngineResult<()>;

    async fn job_stats(&self) -> EngineResult<JobStats>;

    fn executor_stats(&self) -> ExecutorStats;

    fn definition_cache_stats(&self) -> CacheStats;
}

#[async_trait]
pub trait ContentService: Send + Sync {
    async fn create_content_item(&self, content: NewContent) -> EngineResult<ContentItem>;

    async fn get_content_item(&self, id: ContentItemId) -> EngineResult<ContentItem>;

    async fn get_content(&self, id: ContentItemId) -> EngineResult<Vec<u8>>;

    async fn delete_content_item(&self, id: ContentItemId) -> EngineResult<()>;

    async fn list_content_items(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> EngineResult<Vec<ContentItem>>;
}

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn list_tasks(&self, assignee: Option<&str>) -> EngineResult<Vec<Value>>;

    async fn complete_task(&self, task_id: &str, variables: Value) -> EngineResult<()>;
}

#[async_trait]
pub trait HistoryService: Send + Sync {
    async fn historic_process_instance(&self, id: ProcessInstanceId) -> EngineResult<Option<Value>>;
}

#[async_trait]
pub trait FormService: Send + Sync {
    async fn start_form(&self, process_definition_id: ProcessDefinitionId) -> EngineResult<Option<Value>>;

    async fn submit_form(&self, form_key: &str, values: Value) -> EngineResult<()>;
}

pub trait IdentityService: Send + Sync {
    fn set_authenticated_user(&self, user_id: Option<&str>);

    fn authenticated_user(&self) -> Option<String>;
}

#[async_trait]
pub trait IdmIdentityService: Send + Sync {
    async fn find_user(&self, user_id: &str) -> EngineResult<Option<Value>>;

    async fn check_password(&self, user_id: &str, password: &str) -> EngineResult<bool>;
}

#[async_trait]
pub trait FormRepositoryService: Send + Sync {
    async fn deploy_form(&self, key: &str, definition: Value) -> EngineResult<String>;

    async fn get_form_definition(&self, key: &str) -> EngineResult<Option<Value>>;
}

#[async_trait]
pub trait DmnRepositoryService: Send + Sync {
    async fn deploy_decision(&self, resource_name: &str, xml: &str) -> EngineResult<String>;

    async fn list_decisions(&self) -> EngineResult<Vec<String>>;
}

#[async_trait]
pub trait DmnRuleService: Send + Sync {
    async fn execute_decision(&self, decision_key: &str, input: Value) -> EngineResult<Value>;
}
