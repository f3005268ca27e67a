use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commandmate_core::{McpTransport, TaskPriority, TaskStatus};
use commandmate_protocol::{
    ApiClient, ApproveTaskRequest, CreateTaskRequest, DEFAULT_WORKSPACE, McpCallRequest,
    RegisterMcpServerRequest, RejectTaskRequest, UpsertProfileRequest,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "commandmate-ctl", about = "Operator console for CommandMate")]
struct Cli {
    #[arg(long, env = "COMMANDMATE_SERVER", default_value = "http://127.0.0.1:8810")]
    server: String,
    #[arg(long, env = "COMMANDMATE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    CreateTask {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,
        #[arg(long)]
        workspace: Option<String>,
        /// Hold the result for human review before it counts as completed.
        /// Omit to use the server's default.
        #[arg(long)]
        requires_approval: Option<bool>,
        #[arg(long)]
        profile: Option<String>,
    },
    ListTasks {
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
    },
    Approve {
        task_id: String,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    Reject {
        task_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        reviewer: Option<String>,
        /// Mark the task failed instead of putting it back on the queue.
        #[arg(long)]
        no_requeue: bool,
    },
    Retry {
        task_id: String,
    },
    #[command(subcommand)]
    Profile(ProfileCommand),
    #[command(subcommand)]
    Mcp(McpCommand),
    /// Print the dashboard snapshot.
    Status,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Upsert {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long)]
        approval_required: Option<bool>,
    },
    List,
    Learning {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum McpCommand {
    Register {
        #[arg(long)]
        name: String,
        #[arg(long, value_parser = parse_transport, default_value = "http")]
        transport: McpTransport,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
    List {
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
    Tools {
        server_id: String,
        #[arg(long)]
        refresh: bool,
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
    Call {
        server_id: String,
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        arguments: String,
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
    Metrics {
        server_id: String,
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(cli.server, cli.token);

    match cli.command {
        Command::CreateTask {
            title,
            description,
            priority,
            workspace,
            requires_approval,
            profile,
        } => {
            let task = client
                .create_task(&CreateTaskRequest {
                    workspace_id: workspace,
                    title,
                    description,
                    priority,
                    requires_approval,
                    agent_profile: profile,
                })
                .await?;
            info!(task_id = %task.task_id, priority = task.priority.as_str(), "task queued");
            print_json(&task)?;
        }
        Command::ListTasks { status } => {
            print_json(&client.list_tasks(status.map(TaskStatus::as_str)).await?)?;
        }
        Command::Approve { task_id, reviewer, comment } => {
            let task = client.approve(&task_id, &ApproveTaskRequest { reviewer, comment }).await?;
            info!(task_id = %task.task_id, status = %task.status, "approved");
        }
        Command::Reject { task_id, reason, reviewer, no_requeue } => {
            let request = RejectTaskRequest { reason, reviewer, requeue: Some(!no_requeue) };
            let task = client.reject(&task_id, &request).await?;
            info!(task_id = %task.task_id, status = %task.status, "rejected");
        }
        Command::Retry { task_id } => {
            let task = client.retry(&task_id).await?;
            info!(task_id = %task.task_id, attempts = task.attempts, "requeued");
        }
        Command::Profile(command) => profile(&client, command).await?,
        Command::Mcp(command) => mcp(&client, command).await?,
        Command::Status => print_json(&client.status().await?)?,
    }

    Ok(())
}

async fn profile(client: &ApiClient, command: ProfileCommand) -> Result<()> {
    match command {
        ProfileCommand::Upsert { name, description, model, system_prompt, approval_required } => {
            let request = UpsertProfileRequest {
                description,
                model,
                system_prompt,
                approval_required,
                config: None,
            };
            print_json(&client.upsert_profile(&name, &request).await?)
        }
        ProfileCommand::List => print_json(&client.list_profiles().await?),
        ProfileCommand::Learning { name } => print_json(&client.learning(&name).await?),
    }
}

async fn mcp(client: &ApiClient, command: McpCommand) -> Result<()> {
    match command {
        McpCommand::Register { name, transport, endpoint, workspace } => {
            let request = RegisterMcpServerRequest { name, transport, endpoint, enabled: None };
            let server = client.register_mcp_server(&workspace, &request).await?;
            info!(server_id = %server.server_id, "mcp server registered");
            print_json(&server)
        }
        McpCommand::List { workspace } => print_json(&client.list_mcp_servers(&workspace).await?),
        McpCommand::Tools { server_id, refresh, workspace } => {
            print_json(&client.mcp_tools(&workspace, &server_id, refresh).await?)
        }
        McpCommand::Call { server_id, tool, arguments, workspace } => {
            let arguments =
                serde_json::from_str(&arguments).context("--arguments must be valid JSON")?;
            let request = McpCallRequest { tool, arguments };
            print_json(&client.mcp_call(&workspace, &server_id, &request).await?)
        }
        McpCommand::Metrics { server_id, workspace } => {
            print_json(&client.mcp_metrics(&workspace, &server_id).await?)
        }
    }
}

fn parse_priority(raw: &str) -> Result<TaskPriority, String> {
    parse_variant(raw)
}

fn parse_transport(raw: &str) -> Result<McpTransport, String> {
    parse_variant(raw)
}

fn parse_status(raw: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(raw).ok_or_else(|| format!("unknown task status `{raw}`"))
}

fn parse_variant<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown value `{raw}`"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
