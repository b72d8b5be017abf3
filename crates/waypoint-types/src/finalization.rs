use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApprovalPrompt, CheckStatus, RunStatus, RunSummary};

/// Minimal terminal record (`finalization.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finalization {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: String,
    #[serde(default)]
    pub risks: Vec<String>,
    pub rollback: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub required: u64,
    pub granted: u64,
    pub pending: u64,
    #[serde(default)]
    pub prompts: Vec<ApprovalPrompt>,
}

impl ApprovalStats {
    pub fn from_prompts(prompts: &[ApprovalPrompt]) -> Self {
        let granted = prompts.iter().filter(|p| p.approved).count() as u64;
        Self {
            required: prompts.len() as u64,
            granted,
            pending: prompts.len() as u64 - granted,
            prompts: prompts.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvidence {
    pub steps: u64,
    pub tool_calls: u64,
    pub attempts: u64,
    pub checks: BTreeMap<String, CheckStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationEvidence {
    pub agents: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Run(RunEvidence),
    Coordination(CoordinationEvidence),
}

/// The single artifact a caller reads to learn what happened in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationBundle {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: String,
    #[serde(default)]
    pub risks: Vec<String>,
    pub rollback_instructions: String,
    pub approvals: ApprovalStats,
    pub evidence: Evidence,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunSummary {
    pub agent_id: String,
    pub focus: String,
    pub sequence: u32,
    pub run: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted as `coordination.json` and returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSummary {
    pub coordinator_run_id: String,
    pub overall_status: RunStatus,
    pub checkpoint_dir: PathBuf,
    pub agent_runs: Vec<AgentRunSummary>,
    pub completed_at: DateTime<Utc>,
}

pub type MultiAgentSummary = CoordinationSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub run_id: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub status_at_request: RunStatus,
    /// Patch artifacts, relative to the run directory.
    #[serde(default)]
    pub patch_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAck {
    pub ok: bool,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminismReport {
    pub determinism_score: f64,
    pub diff_delta: u32,
    pub tool_call_delta: u32,
}
