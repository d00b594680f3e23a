//! Lumiflow - persistent work-unit scheduler and bookkeeper for
//! partitioned dataset processing

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod sizer;
pub mod store;
pub mod task_handler;

pub use config::{StoreConfig, WorkflowConfig};
pub use error::{LumiflowError, Result};
pub use models::{
    CompletionRecord, DatasetFile, DatasetInfo, Status, TaskDescriptor, TaskOutcome, TaskType,
    TaskUpdate, UnitSource, UnitSpec, UpdateBatch,
};
pub use scheduler::Scheduler;
pub use store::UnitStore;
pub use task_handler::{ReportSummary, StageEngine, TaskHandler};
