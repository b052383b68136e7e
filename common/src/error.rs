use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Why an output path was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathViolation {
    OutsideWorkDir,
    MissingFileName,
}

impl fmt::Display for PathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathViolation::OutsideWorkDir => {
                f.write_str("outside the scope of the task work directory")
            }
            PathViolation::MissingFileName => f.write_str("missing output file name"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("hash collision in work directory {path}: found `{found}`")]
    WorkDirCollision { path: PathBuf, found: String },

    #[error("illegal output path `{path}`: {violation}")]
    IllegalOutputPath {
        path: String,
        violation: PathViolation,
    },

    #[error("invalid output declaration: {0}")]
    InvalidOutputSpec(String),

    #[error("missing output file(s): `{pattern}`")]
    MissingOutput { pattern: String },

    #[error("executor {executor} is saturated")]
    BackendSaturated { executor: String },

    #[error("node {node} is unavailable")]
    NodeUnavailable { node: String },

    #[error("node {node} did not report status for {secs}s")]
    StatusLost { node: String, secs: u64 },

    #[error("script exited with status {exit_code}")]
    ScriptFailed { exit_code: i32 },

    #[error("wall time of {secs}s exceeded")]
    WallTimeExceeded { secs: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("failover rejected after {attempts} attempt(s): {reason}")]
    FailoverExhausted { attempts: u32, reason: String },

    #[error("run halted, no new submissions accepted")]
    Halted,
}

/// How the monitor reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal for the task, never retried.
    Fatal,
    /// Put back in the admission queue without consuming an attempt.
    Requeue,
    /// Node-level fault, resubmit elsewhere through the failover coordinator.
    Failover,
    /// Task-level fault, handled by the task's error strategy.
    TaskFailure,
}

impl TaskError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TaskError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn illegal_path(path: impl Into<String>, violation: PathViolation) -> Self {
        TaskError::IllegalOutputPath {
            path: path.into(),
            violation,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            TaskError::Storage { .. }
            | TaskError::WorkDirCollision { .. }
            | TaskError::IllegalOutputPath { .. }
            | TaskError::InvalidOutputSpec(_)
            | TaskError::FailoverExhausted { .. }
            | TaskError::Halted => Disposition::Fatal,
            TaskError::BackendSaturated { .. } => Disposition::Requeue,
            TaskError::NodeUnavailable { .. } | TaskError::StatusLost { .. } => {
                Disposition::Failover
            }
            TaskError::MissingOutput { .. }
            | TaskError::ScriptFailed { .. }
            | TaskError::WallTimeExceeded { .. }
            | TaskError::Backend(_) => Disposition::TaskFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
