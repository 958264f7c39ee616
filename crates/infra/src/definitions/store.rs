use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use flowforge_core::ProcessDefinitionId;

use super::DefinitionError;
use super::model::ProcessDefinition;

pub type SharedDefinitionStore = Arc<dyn ProcessDefinitionStore>;

/// Durable storage of deployed process definitions.
#[async_trait]
pub trait ProcessDefinitionStore: Send + Sync {
    /// Store a definition as the next version of its key.
    ///
    /// Returns the definition with its assigned version.
    async fn deploy(&self, definition: ProcessDefinition) -> Result<ProcessDefinition, DefinitionError>;

    async fn get(&self, id: ProcessDefinitionId) -> Result<Option<ProcessDefinition>, DefinitionError>;

    /// Highest deployed version of `key`.
    async fn latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, DefinitionError>;

    /// All definitions ordered by key, then version.
    async fn list(&self) -> Result<Vec<ProcessDefinition>, DefinitionError>;

    async fn delete(&self, id: ProcessDefinitionId) -> Result<(), DefinitionError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<ProcessDefinitionId, ProcessDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> DefinitionError {
        DefinitionError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl ProcessDefinitionStore for InMemoryDefinitionStore {
    async fn deploy(&self, mut definition: ProcessDefinition) -> Result<ProcessDefinition, DefinitionError> {
        let mut definitions = self.definitions.write().map_err(|_| Self::poisoned())?;
        let latest = definitions
            .values()
            .filter(|d| d.key == definition.key)
            .map(|d| d.version)
            .max()
            .unwrap_or(0);
        definition.version = latest + 1;
        definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn get(&self, id: ProcessDefinitionId) -> Result<Option<ProcessDefinition>, DefinitionError> {
        let definitions = self.definitions.read().map_err(|_| Self::poisoned())?;
        Ok(definitions.get(&id).cloned())
    }

    async fn latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, DefinitionError> {
        let definitions = self.definitions.read().map_err(|_| Self::poisoned())?;
        Ok(definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessDefinition>, DefinitionError> {
        let definitions = self.definitions.read().map_err(|_| Self::poisoned())?;
        let mut all: Vec<_> = definitions.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(all)
    }

    async fn delete(&self, id: ProcessDefinitionId) -> Result<(), DefinitionError> {
        let mut definitions = self.definitions.write().map_err(|_| Self::poisoned())?;
        definitions
            .remove(&id)
            .map(|_| ())
            .ok_or(DefinitionError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn definition(key: &str) -> ProcessDefinition {
        let xml = format!(r#"<definitions><process id="{key}"/></definitions>"#);
        ProcessDefinition::parse(format!("{key}.bpmn"), xml, true, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn versions_are_numbered_per_key() {
        let store = InMemoryDefinitionStore::new();
        let a1 = store.deploy(definition("a")).await.unwrap();
        let a2 = store.deploy(definition("a")).await.unwrap();
        let b1 = store.deploy(definition("b")).await.unwrap();

        assert_eq!((a1.version, a2.version, b1.version), (1, 2, 1));
        assert_eq!(store.latest_by_key("a").await.unwrap().unwrap().id, a2.id);
        assert!(store.latest_by_key("zzz").await.unwrap().is_none());

        let keys: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| (d.key, d.version))
            .collect();
        assert_eq!(keys, vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 1)]);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = InMemoryDefinitionStore::new();
        let d = store.deploy(definition("a")).await.unwrap();
        store.delete(d.id).await.unwrap();
        assert!(store.get(d.id).await.unwrap().is_none());
        assert!(matches!(store.delete(d.id).await, Err(DefinitionError::NotFound(_))));
    }
}
