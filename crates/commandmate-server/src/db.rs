use anyhow::Result;
use rusqlite::Connection;
use std::{fs, path::Path};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
      task_id TEXT PRIMARY KEY,
      workspace_id TEXT NOT NULL,
      title TEXT NOT NULL,
      description TEXT,
      priority TEXT NOT NULL,
      priority_rank INTEGER NOT NULL,
      status TEXT NOT NULL,
      requires_approval INTEGER NOT NULL DEFAULT 0,
      agent_profile TEXT,
      assigned_agent_id TEXT,
      progress_percent INTEGER NOT NULL DEFAULT 0,
      progress_message TEXT,
      result TEXT,
      error TEXT,
      review_feedback TEXT,
      reviewed_by TEXT,
      attempts INTEGER NOT NULL DEFAULT 0,
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL,
      claimed_at_ms INTEGER,
      completed_at_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS tasks_queue_idx
      ON tasks (status, priority_rank DESC, created_at_ms);

    CREATE TABLE IF NOT EXISTS agents (
      agent_id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      role TEXT NOT NULL,
      state TEXT NOT NULL,
      profile TEXT,
      current_task_id TEXT,
      last_heartbeat_ms INTEGER,
      updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agent_profiles (
      name TEXT PRIMARY KEY,
      description TEXT,
      model TEXT,
      system_prompt TEXT,
      approval_required INTEGER NOT NULL DEFAULT 0,
      config TEXT NOT NULL DEFAULT '{}',
      approved_count INTEGER NOT NULL DEFAULT 0,
      rejected_count INTEGER NOT NULL DEFAULT 0,
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agent_feedback (
      feedback_id TEXT PRIMARY KEY,
      profile TEXT NOT NULL,
      task_id TEXT NOT NULL,
      verdict TEXT NOT NULL,
      comment TEXT,
      reviewer TEXT,
      created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS agent_feedback_profile_idx
      ON agent_feedback (profile, created_at_ms DESC);

    CREATE TABLE IF NOT EXISTS documents (
      document_id TEXT PRIMARY KEY,
      workspace_id TEXT NOT NULL,
      title TEXT NOT NULL,
      content TEXT NOT NULL,
      tags TEXT NOT NULL DEFAULT '[]',
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS mcp_servers (
      server_id TEXT PRIMARY KEY,
      workspace_id TEXT NOT NULL,
      name TEXT NOT NULL,
      transport TEXT NOT NULL,
      endpoint TEXT,
      enabled INTEGER NOT NULL DEFAULT 1,
      call_count INTEGER NOT NULL DEFAULT 0,
      error_count INTEGER NOT NULL DEFAULT 0,
      total_latency_ms INTEGER NOT NULL DEFAULT 0,
      last_error TEXT,
      last_called_at_ms INTEGER,
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL,
      UNIQUE (workspace_id, name)
    );

    CREATE TABLE IF NOT EXISTS mcp_calls (
      call_id TEXT PRIMARY KEY,
      server_id TEXT NOT NULL,
      tool TEXT NOT NULL,
      success INTEGER NOT NULL,
      latency_ms INTEGER NOT NULL,
      error TEXT,
      created_at_ms INTEGER NOT NULL,
      FOREIGN KEY(server_id) REFERENCES mcp_servers(server_id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS mcp_calls_server_idx
      ON mcp_calls (server_id, created_at_ms DESC);
";

pub fn open(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub(crate) fn opt_ms(raw: Option<i64>) -> Option<u64> {
    raw.map(|v| v as u64)
}

pub(crate) fn parse_json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
}
