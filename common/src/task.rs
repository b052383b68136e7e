use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use crate::output::OutputSpec;

/// Content hash of a task (hex SHA-256).
pub type TaskId = String;
pub type NodeId = String;

/// Resolved variables visible to a task's output expressions.
pub type TaskContext = BTreeMap<String, ContextValue>;

/// Value bound to a task input or context variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ContextValue {
    Null,
    Str(String),
    Path(PathBuf),
    List(Vec<ContextValue>),
}

impl ContextValue {
    pub fn is_empty(&self) -> bool {
        match self {
            ContextValue::Null => true,
            ContextValue::Str(s) => s.is_empty(),
            ContextValue::Path(p) => p.as_os_str().is_empty(),
            ContextValue::List(items) => items.is_empty(),
        }
    }

    /// All path values, including those nested in lists.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ContextValue::Path(p) => vec![p.as_path()],
            ContextValue::List(items) => items.iter().flat_map(|v| v.paths()).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Null => Ok(()),
            ContextValue::Str(s) => f.write_str(s),
            ContextValue::Path(p) => write!(f, "{}", p.display()),
            ContextValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequest {
    /// Node slots one attempt occupies.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Part of the task identity; no executor enforces it.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Wall-time limit in seconds.
    #[serde(default)]
    pub time_secs: Option<u64>,
}

fn default_cpus() -> u32 {
    1
}

impl ResourceRequest {
    /// Slots taken on a node with `capacity` slots. A request larger than
    /// the node is capped, so the task runs there alone.
    pub fn slots_on(&self, capacity: u32) -> u32 {
        self.cpus.max(1).min(capacity.max(1))
    }
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: None,
            time_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    #[default]
    Terminate,
    Retry,
    Ignore,
    Finish,
}

/// What the data-flow layer hands to the engine for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDescriptor {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, ContextValue>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Executor name; the configured default when absent.
    #[serde(default)]
    pub executor: Option<String>,
    /// Resubmit script failures on a node not tried yet.
    #[serde(default)]
    pub retry_on_new_node: bool,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            inputs: BTreeMap::new(),
            env: BTreeMap::new(),
            resources: ResourceRequest::default(),
            outputs: Vec::new(),
            error_strategy: ErrorStrategy::default(),
            max_retries: None,
            executor: None,
            retry_on_new_node: false,
        }
    }

    /// Context seen by output expressions once inputs are staged:
    /// path inputs are replaced by their staged (relative) names.
    pub fn staged_context(&self) -> TaskContext {
        self.inputs
            .iter()
            .map(|(k, v)| (k.clone(), staged_value(v)))
            .collect()
    }

    /// File names the staged inputs occupy inside the work directory.
    pub fn staged_names(&self) -> Vec<PathBuf> {
        self.inputs
            .values()
            .flat_map(|v| v.paths())
            .filter_map(|p| p.file_name().map(PathBuf::from))
            .collect()
    }
}

fn staged_value(v: &ContextValue) -> ContextValue {
    match v {
        ContextValue::Path(p) => match p.file_name() {
            Some(name) => ContextValue::Path(PathBuf::from(name)),
            None => ContextValue::Path(p.clone()),
        },
        ContextValue::List(items) => ContextValue::List(items.iter().map(staged_value).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Submitted,
    Running,
    Completed,
    Failed,
    Ignored,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Ignored | TaskState::Aborted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "NEW",
            TaskState::Submitted => "SUBMITTED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Ignored => "IGNORED",
            TaskState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_context_keeps_only_file_names() {
        let mut d = TaskDescriptor::new("align", "echo hi");
        d.inputs.insert(
            "reads".into(),
            ContextValue::List(vec![
                ContextValue::Path("/data/r1.fq".into()),
                ContextValue::Path("/data/r2.fq".into()),
            ]),
        );
        d.inputs
            .insert("sample".into(), ContextValue::Str("s1".into()));

        let ctx = d.staged_context();
        assert_eq!(
            ctx["reads"],
            ContextValue::List(vec![
                ContextValue::Path("r1.fq".into()),
                ContextValue::Path("r2.fq".into()),
            ])
        );
        assert_eq!(ctx["sample"], ContextValue::Str("s1".into()));
        assert_eq!(
            d.staged_names(),
            vec![PathBuf::from("r1.fq"), PathBuf::from("r2.fq")]
        );
    }

    #[test]
    fn descriptor_rejects_unknown_fields() {
        let json = r#"{"name": "a", "script": "true", "bogus": 1}"#;
        assert!(serde_json::from_str::<TaskDescriptor>(json).is_err());
    }

    #[test]
    fn descriptor_defaults() {
        let d: TaskDescriptor = serde_json::from_str(r#"{"name": "a", "script": "true"}"#).unwrap();
        assert_eq!(d.error_strategy, ErrorStrategy::Terminate);
        assert_eq!(d.resources.cpus, 1);
        assert!(d.outputs.is_empty());
    }

    #[test]
    fn cpus_map_to_node_slots() {
        let mut r = ResourceRequest::default();
        assert_eq!(r.slots_on(4), 1);
        r.cpus = 3;
        assert_eq!(r.slots_on(4), 3);
        assert_eq!(r.slots_on(2), 2);
        r.cpus = 0;
        assert_eq!(r.slots_on(4), 1);
    }
}
