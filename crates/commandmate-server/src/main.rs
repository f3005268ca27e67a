use anyhow::Result;
use clap::{Parser, Subcommand};
use commandmate_server::config::ServerConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "commandmate-server", about = "CommandMate task queue and MCP registry service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        /// TOML config file; defaults to the per-user `commandmate/server.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Base URL of the tool gateway used by `gateway` MCP servers.
        #[arg(long, env = "COMMANDMATE_GATEWAY_URL")]
        gateway_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve { config, port, db_path, gateway_url } => {
            let mut settings = ServerConfig::load(config.as_deref())?;
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(db_path) = db_path {
                settings.db_path = db_path;
            }
            if gateway_url.is_some() {
                settings.mcp.gateway_url = gateway_url;
            }
            commandmate_server::serve(settings).await?;
        }
    }

    Ok(())
}
