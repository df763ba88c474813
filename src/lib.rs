pub mod api;
pub mod backend;
pub mod brief;
pub mod config;
pub mod cookies;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod init;
pub mod retry;
pub mod stages;
pub mod task;
pub mod workflow;

pub use brief::{Brief, Credentials};
pub use error::{GenResult, GenerationError};
pub use events::{EventSink, PipelineEvent};
pub use task::{Task, TaskRegistry, TaskStatus};
pub use workflow::{BriefReport, WorkflowOrchestrator};
