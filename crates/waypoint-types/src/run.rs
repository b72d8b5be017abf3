use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Blocked,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single step once its gates and retry loop have concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Blocked,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        RunStatus::from(self).as_str()
    }
}

impl From<StepStatus> for RunStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Success => RunStatus::Success,
            StepStatus::Failed => RunStatus::Failed,
            StepStatus::Blocked => RunStatus::Blocked,
            StepStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Persisted `manifest.json` of a run directory.
///
/// Written once with `final_status = running` when the run is accepted and
/// rewritten exactly once more when the run reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub task_type: String,
    #[serde(default)]
    pub repo_snapshot: Option<String>,
    pub model: String,
    pub policy_version: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub final_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

impl RunManifest {
    pub fn new(
        run_id: impl Into<String>,
        task_type: impl Into<String>,
        model: impl Into<String>,
        policy_version: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task_type: task_type.into(),
            repo_snapshot: None,
            model: model.into(),
            policy_version: policy_version.into(),
            started_at: Utc::now(),
            ended_at: None,
            final_status: RunStatus::Running,
            parent_run_id: None,
        }
    }
}

/// Read-only registry projection of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub task_type: String,
    /// Set for sub-runs; names the coordinator run that owns them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

impl From<&RunManifest> for RunCheckpoint {
    fn from(manifest: &RunManifest) -> Self {
        Self {
            run_id: manifest.run_id.clone(),
            started_at: manifest.started_at,
            ended_at: manifest.ended_at,
            status: manifest.final_status,
            task_type: manifest.task_type.clone(),
            parent_run_id: manifest.parent_run_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u64,
    pub tool_calls: u64,
    #[serde(default)]
    pub failures: Vec<String>,
}

/// Caller-facing result of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub steps: Vec<StepSummary>,
}

pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}
