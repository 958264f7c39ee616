//! Service facades and their registry.

pub mod api;
pub mod content;
pub mod management;
pub mod registry;
pub mod repository;
pub mod runtime;

pub use api::{
    ContentService, DmnRepositoryService, DmnRuleService, FormRepositoryService, FormService,
    HistoryService, IdentityService, IdmIdentityService, ManagementService, ProcessInstance,
    RepositoryService, RuntimeService, TaskService,
};
pub use content::FsContentService;
pub use management::EngineManagementService;
pub use registry::ServiceRegistry;
pub use repository::EngineRepositoryService;
pub use runtime::{EngineRuntimeService, START_PROCESS_JOB};
