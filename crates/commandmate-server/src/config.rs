use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const DEFAULT_PORT: u16 = 8810;

/// Server settings, read from `server.toml` and overridden by CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub auth: AuthConfig,
    pub approval: ApprovalConfig,
    pub agents: AgentsConfig,
    pub mcp: McpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: PathBuf::from("./var/commandmate.db"),
            auth: AuthConfig::default(),
            approval: ApprovalConfig::default(),
            agents: AgentsConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty disables the check.
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Applied to tasks created without an explicit `requires_approval`.
    pub require_by_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub offline_after_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self { offline_after_ms: 120_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub gateway_url: Option<String>,
    pub call_timeout_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self { gateway_url: None, call_timeout_ms: 30_000 }
    }
}

impl ServerConfig {
    /// Loads `path` if given, else the per-user config file if it exists,
    /// else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("commandmate").join("server.toml"))
}
