pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod task;
pub mod workdir;
pub mod worker;

pub use config::{EngineConfig, ExecutorConfig, ExecutorKind};
pub use error::{Disposition, PathViolation, TaskError};
pub use events::{AttemptRecord, FailoverStats, SubmitResponse, TaskEvent, TaskOutcome, TaskView};
pub use output::{OutputOptions, OutputQualifier, OutputSpec, OutputTarget, OutputType, ResolvedOutput};
pub use task::{
    ContextValue, ErrorStrategy, NodeId, ResourceRequest, TaskContext, TaskDescriptor, TaskId,
    TaskState,
};
pub use workdir::WorkDirManager;
pub use worker::*;
