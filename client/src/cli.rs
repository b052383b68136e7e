use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    FailoverStats, SubmitResponse, TaskDescriptor, TaskEvent, TaskView, WorkerMetrics,
};
use reqwest::{Client, StatusCode};
use std::{env, fs, path::Path, time::Duration};

/// Same as the worker:
/// - in Docker: MASTER_URL=http://master:8080
/// - local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Command line client for the task engine master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Submits a task described by a JSON file
    Submit {
        #[arg(value_name = "DESCRIPTOR_JSON")]
        file: String,
        /// Overrides the executor named in the file
        #[arg(long)]
        executor: Option<String>,
        /// Waits until the task reaches a terminal state
        #[arg(long)]
        wait: bool,
    },
    /// Shows one task
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lists every known task
    Tasks,
    /// Aborts an active task
    Abort {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Shows state transitions, optionally for one task
    Events {
        #[arg(long)]
        task: Option<String>,
    },
    /// Shows the failover counters
    Failover,
    /// Lists registered workers and their metrics
    Workers,
}

pub fn load_descriptor(path: &Path, executor: Option<String>) -> Result<TaskDescriptor> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut task: TaskDescriptor =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if executor.is_some() {
        task.executor = executor;
    }
    Ok(task)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            file,
            executor,
            wait,
        } => {
            let task = load_descriptor(Path::new(&file), executor)?;
            let url = format!("{}/api/v1/tasks", base_url);
            let resp = client.post(&url).json(&task).send().await?;
            if !resp.status().is_success() {
                bail!("submit rejected ({}): {}", resp.status(), resp.text().await?);
            }
            let SubmitResponse { id, duplicate } = resp.json().await?;

            println!("Task submitted:");
            println!("  id: {}", id);
            println!("  name: {}", task.name);
            if duplicate {
                println!("  (already active, not queued again)");
            }

            if wait {
                let view = wait_terminal(&client, &base_url, &id).await?;
                print_view(&view);
            }
        }
        Commands::Status { id } => match fetch_view(&client, &base_url, &id).await? {
            Some(view) => print_view(&view),
            None => println!("No task with id {id}"),
        },
        Commands::Tasks => {
            let url = format!("{}/api/v1/tasks", base_url);
            let views: Vec<TaskView> = client.get(&url).send().await?.json().await?;
            if views.is_empty() {
                println!("No tasks yet");
            }
            for v in views {
                println!(
                    "{:<10} {:<24} attempts={} {}",
                    v.state.to_string(),
                    v.name,
                    v.attempts,
                    v.id
                );
            }
        }
        Commands::Abort { id } => {
            let url = format!("{}/api/v1/tasks/{id}/abort", base_url);
            let resp = client.post(&url).send().await?;
            match resp.status() {
                s if s.is_success() => println!("Task {id} aborted"),
                StatusCode::NOT_FOUND => println!("Task {id} is not active"),
                s => bail!("abort failed ({s}): {}", resp.text().await?),
            }
        }
        Commands::Events { task } => {
            let mut url = format!("{}/api/v1/events", base_url);
            if let Some(t) = task {
                url.push_str(&format!("?task={t}"));
            }
            let events: Vec<TaskEvent> = client.get(&url).send().await?.json().await?;
            for e in events {
                println!(
                    "{} {:<10} {:<24} attempt={} node={} {}",
                    e.at.format("%H:%M:%S%.3f"),
                    e.state.to_string(),
                    e.name,
                    e.attempt,
                    e.node.as_deref().unwrap_or("-"),
                    e.detail.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Failover => {
            let url = format!("{}/api/v1/failover", base_url);
            let stats: FailoverStats = client.get(&url).send().await?.json().await?;
            println!("Failover:");
            println!("  max attempts: {}", stats.max_failover_attempts);
            println!("  failed over: {}", stats.total_failed_over);
            println!("  stolen: {}", stats.total_stolen);
        }
        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let workers: Vec<WorkerMetrics> = client.get(&url).send().await?.json().await?;
            if workers.is_empty() {
                println!("No workers registered");
            }
            for w in workers {
                println!("Worker {} ({})", w.worker_id, w.hostname);
                println!("  dead: {}", w.dead);
                println!("  last heartbeat: {}s ago", w.last_heartbeat_secs_ago);
                println!("  slots: {}/{} busy, {} queued", w.active_tasks, w.max_concurrency, w.queued);
                println!(
                    "  tasks: {} started, {} ok, {} failed",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                if let (Some(cpu), Some(mem)) = (w.cpu_percent, w.mem_bytes) {
                    println!("  cpu: {:.1}%  mem: {} MB", cpu, mem / (1024 * 1024));
                }
            }
        }
    }

    Ok(())
}

async fn fetch_view(client: &Client, base_url: &str, id: &str) -> Result<Option<TaskView>> {
    let url = format!("{}/api/v1/tasks/{id}", base_url);
    let resp = client.get(&url).send().await?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    Ok(Some(resp.error_for_status()?.json().await?))
}

async fn wait_terminal(client: &Client, base_url: &str, id: &str) -> Result<TaskView> {
    loop {
        if let Some(view) = fetch_view(client, base_url, id).await? {
            if view.state.is_terminal() {
                return Ok(view);
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn print_view(v: &TaskView) {
    println!("Task:");
    println!("  id: {}", v.id);
    println!("  name: {}", v.name);
    println!("  state: {}", v.state);
    println!("  executor: {}", v.executor);
    if let Some(dir) = &v.work_dir {
        println!("  work dir: {}", dir.display());
    }
    println!("  attempts: {} on {:?}", v.attempts, v.nodes_tried);
    if v.cached {
        println!("  cached: yes");
    }
    if let Some(err) = &v.error {
        println!("  error: {}", err);
    }
    for out in &v.outputs {
        for f in &out.files {
            println!("  output[{}]: {}", out.index, f.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ErrorStrategy;

    #[test]
    fn parses_submit_flags() {
        let cli = Cli::try_parse_from(["client", "submit", "task.json", "--executor", "workers", "--wait"])
            .unwrap();
        assert_eq!(
            cli.command,
            Commands::Submit {
                file: "task.json".into(),
                executor: Some("workers".into()),
                wait: true,
            }
        );
    }

    #[test]
    fn parses_events_filter() {
        let cli = Cli::try_parse_from(["client", "events", "--task", "abc"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Events {
                task: Some("abc".into())
            }
        );
        assert!(Cli::try_parse_from(["client", "status"]).is_err());
    }

    #[test]
    fn descriptor_file_with_executor_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.json");
        fs::write(
            &path,
            r#"{"name": "align", "script": "bwa mem ref.fa r.fq > out.sam",
                "outputs": [{"target": "out.sam"}], "error_strategy": "RETRY"}"#,
        )
        .unwrap();

        let task = load_descriptor(&path, Some("workers".into())).unwrap();
        assert_eq!(task.name, "align");
        assert_eq!(task.error_strategy, ErrorStrategy::Retry);
        assert_eq!(task.executor.as_deref(), Some("workers"));
        assert_eq!(task.outputs.len(), 1);
    }

    #[test]
    fn descriptor_with_unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"name": "x", "script": "true", "retry": 2}"#).unwrap();
        assert!(load_descriptor(&path, None).is_err());
    }
}
