use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{attempt_from_args, Tool, ToolOutput};

/// Runs a fixed shell command once per attempt.
///
/// The goal, attempt number and seed are exported as `WAYPOINT_GOAL`,
/// `WAYPOINT_ATTEMPT` and `WAYPOINT_SEED`. When the orchestrator supplies an
/// `artifact_dir`, combined stdout/stderr is written to
/// `attempt-<n>.log` inside it and returned as the output reference.
pub struct ShellTool {
    name: String,
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn build_command(&self, args: &Value) -> Command {
        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.args(["/C", self.command.as_str()]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", self.command.as_str()]);
            c
        };
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let goal = args.get("goal").and_then(Value::as_str).unwrap_or("");
        let seed = args.get("seed").and_then(Value::as_str).unwrap_or("");
        command
            .env("WAYPOINT_GOAL", goal)
            .env("WAYPOINT_ATTEMPT", attempt_from_args(args).to_string())
            .env("WAYPOINT_SEED", seed)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput> {
        self.execute_with_cancel(args, CancellationToken::new()).await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        let child = self.build_command(&args).spawn()?;
        // Dropping the pending future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("command cancelled"),
            result = child.wait_with_output() => result?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let mut result = ToolOutput::exit(exit_code);

        if let Some(dir) = args.get("artifact_dir").and_then(Value::as_str) {
            let path = Path::new(dir).join(format!("attempt-{}.log", attempt_from_args(&args)));
            let mut log = output.stdout;
            log.extend_from_slice(&output.stderr);
            fs::create_dir_all(dir).await?;
            fs::write(&path, log).await?;
            result = result.with_output_ref(path.display().to_string());
        }

        tracing::debug!(tool = %self.name, exit_code, "shell tool finished");
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let tool = ShellTool::new("shell", "exit 3");
        let output = tool.execute(json!({ "goal": "g", "attempt": 1 })).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.output_ref.is_none());
    }

    #[tokio::test]
    async fn captures_output_into_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new("shell", "echo \"$WAYPOINT_GOAL #$WAYPOINT_ATTEMPT\"");
        let args = json!({
            "goal": "build docs",
            "attempt": 2,
            "artifact_dir": dir.path().display().to_string(),
        });

        let output = tool.execute(args).await.unwrap();

        assert!(output.is_success());
        let log_path = output.output_ref.unwrap();
        assert!(log_path.ends_with("attempt-2.log"));
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.trim(), "build docs #2");
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_command() {
        let tool = ShellTool::new("shell", "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tool
            .execute_with_cancel(json!({ "attempt": 1 }), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
