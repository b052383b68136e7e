use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Child processes on the master host.
    Local,
    /// Remote workers pulling assignments over HTTP.
    Workers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub name: String,
    pub kind: ExecutorKind,
    /// Slots per node. Remote workers announce their own when registering.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// How long `UNKNOWN` status is tolerated before the node is
    /// considered lost.
    #[serde(default = "default_unknown_timeout_secs")]
    pub unknown_timeout_secs: u64,
    /// Tasks waiting for a slot before new submissions are refused.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

fn default_concurrency() -> u32 {
    4
}

fn default_unknown_timeout_secs() -> u64 {
    60
}

fn default_max_queued() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub work_dir: PathBuf,
    pub bind_addr: String,
    pub poll_interval_ms: u64,
    /// Upper bound for a single submit or poll call.
    pub call_timeout_ms: u64,
    pub max_failover_attempts: u32,
    pub default_max_retries: u32,
    /// Skip tasks whose work directory holds a successful previous run.
    pub resume: bool,
    pub default_executor: String,
    pub executors: Vec<ExecutorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            bind_addr: "0.0.0.0:8080".to_string(),
            poll_interval_ms: 1000,
            call_timeout_ms: 5000,
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            resume: false,
            default_executor: "local".to_string(),
            executors: vec![
                ExecutorConfig {
                    name: "local".to_string(),
                    kind: ExecutorKind::Local,
                    concurrency: default_concurrency(),
                    unknown_timeout_secs: default_unknown_timeout_secs(),
                    max_queued: default_max_queued(),
                },
                ExecutorConfig {
                    name: "workers".to_string(),
                    kind: ExecutorKind::Workers,
                    concurrency: default_concurrency(),
                    unknown_timeout_secs: 30,
                    max_queued: default_max_queued(),
                },
            ],
        }
    }
}

impl EngineConfig {
    /// Config file named by `ENGINE_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match env::var("ENGINE_CONFIG") {
            Ok(path) => Self::from_json(
                &fs::read_to_string(&path).with_context(|| format!("reading {path}"))?,
            )
            .with_context(|| format!("parsing {path}"))?,
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("POLL_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            self.poll_interval_ms = v;
        }
        if let Some(v) = lookup("MAX_FAILOVER_ATTEMPTS").and_then(|s| s.parse().ok()) {
            self.max_failover_attempts = v;
        }
        if let Some(v) = lookup("RESUME").and_then(|s| s.parse().ok()) {
            self.resume = v;
        }
        if let Some(v) = lookup("LOCAL_CONCURRENCY").and_then(|s| s.parse::<u32>().ok()) {
            for e in self
                .executors
                .iter_mut()
                .filter(|e| e.kind == ExecutorKind::Local)
            {
                e.concurrency = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failover_attempts == 0 {
            anyhow::bail!("max_failover_attempts must be at least 1");
        }
        if let Some(e) = self.executors.iter().find(|e| e.max_queued == 0) {
            anyhow::bail!("executor `{}` needs max_queued of at least 1", e.name);
        }
        if !self.executors.iter().any(|e| e.name == self.default_executor) {
            anyhow::bail!("default executor `{}` is not configured", self.default_executor);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
