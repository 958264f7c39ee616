use async_trait::async_trait;

use flowforge_core::{ContentItemId, ProcessInstanceId, SharedClock};
use flowforge_infra::content::{ContentItem, FsContentStore, NewContent};

use super::api::ContentService;
use crate::error::EngineResult;

/// Content service backed by a folder on the local filesystem.
pub struct FsContentService {
    store: FsContentStore,
    clock: SharedClock,
}

impl FsContentService {
    pub fn new(store: FsContentStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &FsContentStore {
        &self.store
    }
}

#[async_trait]
impl ContentService for FsContentService {
    async fn create_content_item(&self, content: NewContent) -> EngineResult<ContentItem> {
        Ok(self.store.create(content, self.clock.now()).await?)
    }

    async fn get_content_item(&self, id: ContentItemId) -> EngineResult<ContentItem> {
        Ok(self.store.get(id).await?)
    }

    async fn get_content(&self, id: ContentItemId) -> EngineResult<Vec<u8>> {
        Ok(self.store.read(id).await?)
    }

    async fn delete_content_item(&self, id: ContentItemId) -> EngineResult<()> {
        Ok(self.store.delete(id).await?)
    }

    async fn list_content_items(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> EngineResult<Vec<ContentItem>> {
        Ok(self.store.list(process_instance_id).await?)
    }
}
