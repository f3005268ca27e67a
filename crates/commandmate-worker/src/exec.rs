use anyhow::{Context, Result};
use commandmate_protocol::TaskRecord;
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::process::Command;

/// Bytes of stdout/stderr kept when reporting a run.
const OUTPUT_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}

/// Runs `program` for one task. The task and the profile's lessons are passed
/// through the environment so any executable can act as an agent.
pub async fn run_command(
    program: &str,
    args: &[String],
    task: &TaskRecord,
    lessons: &[String],
) -> Result<Execution> {
    let output = Command::new(program)
        .args(args)
        .env("COMMANDMATE_TASK_ID", &task.task_id)
        .env("COMMANDMATE_TASK", serde_json::to_string(task)?)
        .env("COMMANDMATE_LESSONS", serde_json::to_string(lessons)?)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;

    Ok(Execution::from_output(
        output.status.success(),
        output.status.code(),
        &output.stdout,
        &output.stderr,
    ))
}

impl Execution {
    fn from_output(success: bool, exit_code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Self {
        let stdout = tail(stdout);
        let stderr = tail(stderr);
        let error = (!success).then(|| {
            if stderr.trim().is_empty() {
                match exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr.trim().to_string()
            }
        });
        Self { success, result: json!({ "exit_code": exit_code, "stdout": stdout }), error }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= OUTPUT_LIMIT {
        return text.into_owned();
    }
    let mut start = text.len() - OUTPUT_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use commandmate_core::{TaskPriority, TaskStatus};

    fn task() -> TaskRecord {
        TaskRecord {
            task_id: "task-1".to_string(),
            workspace_id: "default".to_string(),
            title: "summarize".to_string(),
            description: None,
            priority: TaskPriority::Medium,
            status: TaskStatus::InProgress,
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
    fn failure_prefers_stderr() {
        let run = Execution::from_output(false, Some(2), b"partial", b"boom\n");
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(run.result["exit_code"], 2);
        assert_eq!(run.result["stdout"], "partial");

        let quiet = Execution::from_output(false, Some(3), b"", b"");
        assert_eq!(quiet.error.as_deref(), Some("exited with code 3"));
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(OUTPUT_LIMIT) + "END";
        let kept = tail(long.as_bytes());
        assert_eq!(kept.len(), OUTPUT_LIMIT);
        assert!(kept.ends_with("END"));
    }

    #[tokio::test]
    async fn command_sees_task_environment() {
        let args = vec!["-c".to_string(), "printf '%s' \"$COMMANDMATE_TASK_ID\"".to_string()];
        let run = run_command("sh", &args, &task(), &[]).await.expect("run sh");
        assert!(run.success);
        assert_eq!(run.result["stdout"], "task-1");
        assert_eq!(run.error, None);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let result = run_command("/definitely/not/here", &[], &task(), &[]).await;
        assert!(result.is_err());
    }
}
