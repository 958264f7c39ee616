//! Infrastructure layer: job execution, caching, definition and content storage.

pub mod cache;
pub mod content;
pub mod definitions;
pub mod jobs;
