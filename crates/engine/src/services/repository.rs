use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use flowforge_core::{ProcessDefinitionId, SharedClock};
use flowforge_infra::cache::ProcessDefinitionCache;
use flowforge_infra::definitions::{DefinitionError, ProcessDefinition, SharedDefinitionStore};

use super::api::RepositoryService;
use crate::error::EngineResult;

/// Repository service over the definition store and its cache.
pub struct EngineRepositoryService {
    store: SharedDefinitionStore,
    cache: Arc<ProcessDefinitionCache>,
    clock: SharedClock,
    safe_xml: bool,
}

impl EngineRepositoryService {
    pub fn new(
        store: SharedDefinitionStore,
        cache: Arc<ProcessDefinitionCache>,
        clock: SharedClock,
        safe_xml: bool,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            safe_xml,
        }
    }
}

#[async_trait]
impl RepositoryService for EngineRepositoryService {
    async fn deploy(&self, resource_name: &str, xml: &str) -> EngineResult<ProcessDefinition> {
        let parsed = ProcessDefinition::parse(resource_name, xml, self.safe_xml, self.clock.now())?;
        let deployed = self.store.deploy(parsed).await?;
        self.cache.put(deployed.clone());

        info!(
            definition_id = %deployed.id,
            key = %deployed.key,
            version = deployed.version,
            "process definition deployed"
        );
        Ok(deployed)
    }

    async fn get_process_definition(
        &self,
        id: ProcessDefinitionId,
    ) -> EngineResult<Arc<ProcessDefinition>> {
        Ok(self.cache.get(id).await?)
    }

    async fn get_latest_process_definition(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>> {
        let latest = self
            .store
            .latest_by_key(key)
            .await?
            .ok_or_else(|| DefinitionError::UnknownKey(key.to_string()))?;
        Ok(self.cache.get(latest.id).await?)
    }

    async fn list_process_definitions(&self) -> EngineResult<Vec<ProcessDefinition>> {
        Ok(self.store.list().await?)
    }

    async fn delete_process_definition(&self, id: ProcessDefinitionId) -> EngineResult<()> {
        self.store.delete(id).await?;
        self.cache.invalidate(id);
        info!(definition_id = %id, "process definition deleted");
        Ok(())
    }
}
