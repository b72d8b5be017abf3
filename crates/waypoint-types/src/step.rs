use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StepStatus;

pub const CHECK_NAMES: [&str; 4] = ["lint", "typecheck", "test", "build"];

/// Policy context captured in the plan: what will be asked of the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub policy_version: String,
    pub tool: String,
    pub intended_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub step_id: String,
    pub run_id: String,
    pub sequence: u32,
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub policy_context: PolicyContext,
    /// Stable hash of the goal text.
    pub seed: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub id: String,
    pub category: String,
    pub target: String,
    pub reason: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// One recorded attempt to invoke a tool. Appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub step_id: String,
    pub tool: String,
    pub attempt: u32,
    pub args: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Skip,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NextAction {
    Repair,
    ApprovalRequired,
}

/// Why a step did not succeed. Carried alongside the status for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ApprovalRequired,
    PolicyRejected,
    ToolUnavailable,
    ToolExecutionFailure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub checks: BTreeMap<String, CheckStatus>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    pub next_action: Option<NextAction>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    /// Every known check set to `skip`.
    pub fn skipped_checks() -> BTreeMap<String, CheckStatus> {
        CHECK_NAMES
            .iter()
            .map(|name| (name.to_string(), CheckStatus::Skip))
            .collect()
    }

    pub fn metric(&self, key: &str) -> u64 {
        self.metrics.get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub step_id: String,
    pub algorithm: String,
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub computed_at: DateTime<Utc>,
}
