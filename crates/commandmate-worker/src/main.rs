mod exec;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commandmate_protocol::{
    ApiClient, ClaimNextRequest, CompleteTaskRequest, Envelope, EventKind, ProgressRequest,
    RegisterAgentRequest, TaskRecord,
};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const COMPLETE_ATTEMPTS: u32 = 3;
#[cfg(not(test))]
const COMPLETE_BACKOFF: Duration = Duration::from_secs(2);
#[cfg(test)]
const COMPLETE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Parser)]
#[command(name = "commandmate-worker", about = "CommandMate agent worker")]
struct Cli {
    #[arg(long, env = "COMMANDMATE_AGENT_ID")]
    agent_id: String,
    #[arg(long, env = "COMMANDMATE_SERVER", default_value = "http://127.0.0.1:8810")]
    server: String,
    #[arg(long, env = "COMMANDMATE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register (or update) this agent with the server.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "worker")]
        role: String,
        #[arg(long)]
        profile: Option<String>,
    },
    Heartbeat,
    /// Claim the highest-priority queued task.
    ClaimNext {
        #[arg(long)]
        workspace: Option<String>,
    },
    Claim {
        #[arg(long)]
        task_id: String,
    },
    Progress {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        percent: Option<u32>,
        #[arg(long)]
        message: Option<String>,
    },
    Complete {
        #[arg(long)]
        task_id: String,
        /// Report the task as failed instead of succeeded.
        #[arg(long)]
        failed: bool,
        /// JSON result payload; plain text is sent as a JSON string.
        #[arg(long)]
        result: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
    /// Claim tasks and run a command for each until interrupted.
    Run {
        #[arg(long)]
        workspace: Option<String>,
        /// Process at most one task, then exit.
        #[arg(long)]
        once: bool,
        /// Upper bound on how long to wait for a queued-task event before polling.
        #[arg(long, default_value_t = 15_000)]
        poll_interval_ms: u64,
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Print lifecycle events as they happen.
    Watch,
}

struct RunOptions {
    workspace: Option<String>,
    once: bool,
    poll_interval: Duration,
    program: String,
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(cli.server, cli.token);
    let agent_id = cli.agent_id;

    match cli.command {
        Command::Register { name, role, profile } => {
            let agent = client
                .register_agent(&RegisterAgentRequest { agent_id, name, role, profile })
                .await?;
            info!(agent_id = %agent.agent_id, state = ?agent.state, "registered");
        }
        Command::Heartbeat => {
            let agent = client.heartbeat(&agent_id).await?;
            info!(agent_id = %agent.agent_id, state = ?agent.state, "heartbeat sent");
        }
        Command::ClaimNext { workspace } => {
            let request = ClaimNextRequest { agent_id, workspace_id: workspace };
            match client.claim_next(&request).await? {
                Some(task) => print_task(&task)?,
                None => info!("queue is empty"),
            }
        }
        Command::Claim { task_id } => {
            let task = client.claim(&task_id, &agent_id).await?;
            print_task(&task)?;
        }
        Command::Progress { task_id, percent, message } => {
            let task =
                client.progress(&task_id, &ProgressRequest { agent_id, percent, message }).await?;
            info!(task_id = %task.task_id, percent = task.progress_percent, "progress reported");
        }
        Command::Complete { task_id, failed, result, error } => {
            let request = CompleteTaskRequest {
                agent_id,
                success: !failed,
                result: result.map(|raw| parse_result(&raw)),
                error,
            };
            let task = client.complete(&task_id, &request).await?;
            info!(task_id = %task.task_id, status = %task.status, "completion reported");
        }
        Command::Run { workspace, once, poll_interval_ms, command } => {
            let (program, args) =
                command.split_first().context("a command to run is required after --")?;
            let options = RunOptions {
                workspace,
                once,
                poll_interval: Duration::from_millis(poll_interval_ms),
                program: program.clone(),
                args: args.to_vec(),
            };
            tokio::select! {
                result = run(&client, &agent_id, &options) => result?,
                _ = tokio::signal::ctrl_c() => info!(agent_id = %agent_id, "worker stopping"),
            }
        }
        Command::Watch => watch(&client).await?,
    }

    Ok(())
}

async fn run(client: &ApiClient, agent_id: &str, options: &RunOptions) -> Result<()> {
    info!(agent_id = %agent_id, program = %options.program, "worker started");
    let request =
        ClaimNextRequest { agent_id: agent_id.to_string(), workspace_id: options.workspace.clone() };

    let events_url = client.events_url()?;
    let mut own_profile = None;

    loop {
        match client.heartbeat(agent_id).await {
            Ok(agent) => own_profile = agent.profile,
            Err(err) => warn!(agent_id = %agent_id, error = %err, "heartbeat failed"),
        }

        match client.claim_next(&request).await {
            Ok(Some(task)) => {
                process_task(client, agent_id, own_profile.as_deref(), options, &task).await;
                if options.once {
                    return Ok(());
                }
            }
            Ok(None) if options.once => {
                info!("queue is empty");
                return Ok(());
            }
            Ok(None) => wait_for_work(&events_url, options.poll_interval).await,
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "claim failed");
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }
}

/// Runs one claimed task to completion. Server errors are logged rather than
/// returned so one flaky request does not stop the worker.
async fn process_task(
    client: &ApiClient,
    agent_id: &str,
    own_profile: Option<&str>,
    options: &RunOptions,
    task: &TaskRecord,
) {
    info!(task_id = %task.task_id, title = %task.title, attempt = task.attempts, "task claimed");

    let lessons = match lesson_profile(task, own_profile) {
        Some(profile) => match client.learning(profile).await {
            Ok(learning) => learning.summary.lessons,
            Err(err) => {
                warn!(profile = %profile, error = %err, "could not load profile lessons");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let started = ProgressRequest {
        agent_id: agent_id.to_string(),
        percent: Some(0),
        message: Some(format!("running {}", options.program)),
    };
    if let Err(err) = client.progress(&task.task_id, &started).await {
        warn!(task_id = %task.task_id, error = %err, "progress report failed");
    }

    let request = match exec::run_command(&options.program, &options.args, task, &lessons).await
    {
        Ok(run) => CompleteTaskRequest {
            agent_id: agent_id.to_string(),
            success: run.success,
            result: Some(run.result),
            error: run.error,
        },
        Err(err) => CompleteTaskRequest {
            agent_id: agent_id.to_string(),
            success: false,
            result: None,
            error: Some(format!("{err:#}")),
        },
    };

    for attempt in 1..=COMPLETE_ATTEMPTS {
        match client.complete(&task.task_id, &request).await {
            Ok(done) => {
                info!(task_id = %done.task_id, status = %done.status, "task reported");
                return;
            }
            Err(err) => {
                warn!(task_id = %task.task_id, attempt, error = %err, "completion report failed");
                if attempt < COMPLETE_ATTEMPTS {
                    tokio::time::sleep(COMPLETE_BACKOFF * attempt).await;
                }
            }
        }
    }
    error!(task_id = %task.task_id, "giving up on completion report; task stays in progress");
}

/// Profile whose lessons prime a run: the task's own, else the one this agent
/// registered with.
fn lesson_profile<'a>(task: &'a TaskRecord, own_profile: Option<&'a str>) -> Option<&'a str> {
    task.agent_profile.as_deref().or(own_profile)
}

/// Sleeps until a task is queued or `poll_interval` passes, whichever is first.
async fn wait_for_work(events_url: &str, poll_interval: Duration) {
    match tokio::time::timeout(poll_interval, next_queued_event(events_url)).await {
        Ok(Ok(())) => debug!("woken by queued task"),
        Ok(Err(err)) => {
            debug!(error = %err, "event feed unavailable, polling");
            tokio::time::sleep(poll_interval).await;
        }
        Err(_) => {}
    }
}

async fn next_queued_event(events_url: &str) -> Result<()> {
    let (mut socket, _) = connect_async(events_url).await?;
    while let Some(frame) = socket.next().await {
        if let Message::Text(text) = frame?
            && let Ok(envelope) = serde_json::from_str::<Envelope>(&text)
            && matches!(envelope.kind, EventKind::TaskQueued(_))
        {
            return Ok(());
        }
    }
    anyhow::bail!("event feed closed")
}

async fn watch(client: &ApiClient) -> Result<()> {
    let (mut socket, _) = connect_async(client.events_url()?).await?;
    info!("watching {}", client.base_url());
    while let Some(frame) = socket.next().await {
        if let Message::Text(text) = frame? {
            match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => info!(
                    task_id = ?envelope.task_id,
                    workspace_id = ?envelope.workspace_id,
                    kind = ?envelope.kind,
                    "event"
                ),
                Err(err) => warn!(error = %err, "undecodable event"),
            }
        }
    }
    Ok(())
}

fn parse_result(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_task(task: &TaskRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(task)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_accepts_json_or_text() {
        assert_eq!(parse_result(r#"{"pages": 3}"#), serde_json::json!({ "pages": 3 }));
        assert_eq!(parse_result("all good"), serde_json::json!("all good"));
    }

    fn claimed_task() -> TaskRecord {
        TaskRecord {
            task_id: "task-1".to_string(),
            workspace_id: "default".to_string(),
            title: "t".to_string(),
            description: None,
            priority: commandmate_core::TaskPriority::Medium,
            status: commandmate_core::TaskStatus::InProgress,
            requires_approval: false,
            agent_profile: None,
            assigned_agent_id: Some("agent-1".to_string()),
            progress_percent: 0,
            progress_message: None,
            result: None,
            error: None,
            review_feedback: None,
            reviewed_by: None,
            attempts: 1,
            created_at_ms: 0,
            updated_at_ms: 0,
            claimed_at_ms: Some(0),
            completed_at_ms: None,
        }
    }

    #[test]
    fn lessons_fall_back_to_own_profile() {
        let mut task = claimed_task();
        assert_eq!(lesson_profile(&task, Some("writer")), Some("writer"));
        assert_eq!(lesson_profile(&task, None), None);

        task.agent_profile = Some("editor".to_string());
        assert_eq!(lesson_profile(&task, Some("writer")), Some("editor"));
    }

    #[tokio::test]
    async fn unreachable_server_does_not_abort_task_processing() {
        // Nothing listens on port 9 locally, so every report fails fast.
        let client = ApiClient::new("http://127.0.0.1:9", None);
        let options = RunOptions {
            workspace: None,
            once: true,
            poll_interval: Duration::from_millis(10),
            program: "true".to_string(),
            args: Vec::new(),
        };
        tokio::time::timeout(
            Duration::from_secs(10),
            process_task(&client, "agent-1", None, &options, &claimed_task()),
        )
        .await
        .expect("task processing returns despite failed reports");
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "commandmate-worker",
            "--agent-id",
            "agent-1",
            "run",
            "--once",
            "--",
            "python3",
            "agent.py",
            "--fast",
        ])
        .expect("parse cli");
        match cli.command {
            Command::Run { once, command, .. } => {
                assert!(once);
                assert_eq!(command, vec!["python3", "agent.py", "--fast"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
