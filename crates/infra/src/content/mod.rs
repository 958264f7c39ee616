//! Filesystem content storage.
//!
//! Each item is two files under the root folder: `<id>.bin` with the bytes and
//! `<id>.json` with the metadata.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flowforge_core::{ContentItemId, ProcessInstanceId};

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content root folder does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("content item not found: {0}")]
    NotFound(ContentItemId),

    #[error("invalid content metadata for {id}: {reason}")]
    InvalidMetadata { id: ContentItemId, reason: String },

    #[error("content I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of a stored content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentItemId,
    pub name: String,
    pub mime_type: Option<String>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// New content to store.
#[derive(Debug, Clone, Default)]
pub struct NewContent {
    pub name: String,
    pub mime_type: Option<String>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub data: Vec<u8>,
}

impl NewContent {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open a store rooted at `root`, creating the folder when `create_root` is set.
    pub async fn open(root: impl Into<PathBuf>, create_root: bool) -> Result<Self, ContentError> {
        let root = root.into();
        if !tokio::fs::try_exists(&root).await? {
            if !create_root {
                return Err(ContentError::RootMissing(root));
            }
            tokio::fs::create_dir_all(&root).await?;
            info!(root = %root.display(), "created content root folder");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, id: ContentItemId) -> PathBuf {
        self.root.join(format!("{id}.bin"))
    }

    fn meta_path(&self, id: ContentItemId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    pub async fn create(&self, content: NewContent, now: DateTime<Utc>) -> Result<ContentItem, ContentError> {
        let item = ContentItem {
            id: ContentItemId::new(),
            name: content.name,
            mime_type: content.mime_type,
            process_instance_id: content.process_instance_id,
            size: content.data.len() as u64,
            created_at: now,
        };

        tokio::fs::write(self.data_path(item.id), &content.data).await?;
        let meta = serde_json::to_vec_pretty(&item).map_err(|e| ContentError::InvalidMetadata {
            id: item.id,
            reason: e.to_string(),
        })?;
        // Metadata last: an item without metadata is invisible to `list`
        tokio::fs::write(self.meta_path(item.id), meta).await?;

        debug!(content_id = %item.id, size = item.size, "content item stored");
        Ok(item)
    }

    pub async fn get(&self, id: ContentItemId) -> Result<ContentItem, ContentError> {
        let bytes = match tokio::fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| ContentError::InvalidMetadata {
            id,
            reason: e.to_string(),
        })
    }

    pub async fn read(&self, id: ContentItemId) -> Result<Vec<u8>, ContentError> {
        match tokio::fs::read(self.data_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ContentError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: ContentItemId) -> Result<(), ContentError> {
        match tokio::fs::remove_file(self.meta_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_file(self.data_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(content_id = %id, "content item deleted");
        Ok(())
    }

    /// All items, oldest first. Optionally only those of one process instance.
    pub async fn list(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<ContentItem>, ContentError> {
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let id = path
                .extension()
                .filter(|ext| *ext == "json")
                .and_then(|_| path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<ContentItemId>().ok());
            let Some(id) = id else {
                continue;
            };

            let item = self.get(id).await?;
            if process_instance_id.is_none_or(|pid| item.process_instance_id == Some(pid)) {
                items.push(item);
            }
        }
        items.sort_by_key(|i| (i.created_at, *i.id.as_uuid()));
        Ok(items)
    }
}
