use std::fs;

use chrono::Utc;
use sha2::{Digest, Sha256};

use waypoint_types::{
    ApprovalPrompt, ApprovalStats, CoordinationEvidence, CoordinationSummary, Evidence,
    Finalization, FinalizationBundle, IntegrityRecord, RunEvidence, RunStatus, StepPlan,
    StepResult,
};

use crate::error::{OrchestratorError, Result};
use crate::store::{
    RunDir, StepDir, FINALIZATION_BUNDLE_FILE, FINALIZATION_FILE, INTEGRITY_FILE, PATCH_FILE,
    PLAN_FILE, RESULTS_FILE, TOOL_CALLS_FILE,
};

pub const HASH_ALGORITHM: &str = "sha256";

/// Everything finalization needs to know about one executed step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub plan: StepPlan,
    pub prompts: Vec<ApprovalPrompt>,
    pub result: StepResult,
    pub integrity: IntegrityRecord,
}

impl StepRecord {
    pub fn attempts(&self) -> u64 {
        self.result.metric("attempts")
    }

    pub fn tool_calls(&self) -> u64 {
        self.result.metric("tool_calls")
    }
}

// ============================================================================
// Integrity
// ============================================================================

/// Hashes the persisted plan, tool calls, result and patch of a step and
/// writes `integrity.json`. Absent records contribute nothing.
pub fn write_integrity(step: &StepDir, previous_hash: Option<String>) -> Result<IntegrityRecord> {
    let mut hasher = Sha256::new();
    for name in [PLAN_FILE, TOOL_CALLS_FILE, RESULTS_FILE, PATCH_FILE] {
        let path = step.path().join(name);
        if !path.exists() {
            continue;
        }
        let bytes = fs::read(&path).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to read {} for hashing: {}", name, e))
        })?;
        hasher.update(name.as_bytes());
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }

    let record = IntegrityRecord {
        step_id: step.step_id().to_string(),
        algorithm: HASH_ALGORITHM.to_string(),
        content_hash: format!("{:x}", hasher.finalize()),
        previous_hash,
        computed_at: Utc::now(),
    };
    step.write_record(INTEGRITY_FILE, &record)?;
    Ok(record)
}

// ============================================================================
// Run finalization
// ============================================================================

pub fn finalize_run(
    run: &RunDir,
    run_id: &str,
    status: RunStatus,
    steps: &[StepRecord],
) -> Result<FinalizationBundle> {
    write_run_finalization(run, run_id, status, steps, None)
}

/// Finalizes a run as `failed` after its execution stopped on `reason`.
/// `steps` holds only the steps that completed. A `finalization.json` left by
/// an earlier partial attempt is kept.
pub fn finalize_aborted_run(
    run: &RunDir,
    run_id: &str,
    steps: &[StepRecord],
    reason: &str,
) -> Result<FinalizationBundle> {
    write_run_finalization(run, run_id, RunStatus::Failed, steps, Some(reason))
}

fn write_run_finalization(
    run: &RunDir,
    run_id: &str,
    status: RunStatus,
    steps: &[StepRecord],
    abort_reason: Option<&str>,
) -> Result<FinalizationBundle> {
    let attempts: u64 = steps.iter().map(StepRecord::attempts).sum();
    let tool_calls: u64 = steps.iter().map(StepRecord::tool_calls).sum();
    let reason = abort_reason
        .map(ToString::to_string)
        .or_else(|| {
            steps
                .last()
                .and_then(|step| step.result.failures.first().cloned())
        })
        .unwrap_or_default();

    let summary = match status {
        RunStatus::Success => format!(
            "Completed {} step(s) in {} attempt(s)",
            steps.len(),
            attempts
        ),
        RunStatus::Failed => format!("Failed after {} attempt(s): {}", attempts, reason),
        RunStatus::Blocked => format!("Blocked: {}", reason),
        RunStatus::Cancelled => format!("Cancelled after {} attempt(s)", attempts),
        RunStatus::Running => "Run did not reach a terminal state".to_string(),
    };

    let patch_refs = steps
        .iter()
        .filter(|step| run.path().join(&step.plan.step_id).join(PATCH_FILE).exists())
        .map(|step| format!("{}/{}", step.plan.step_id, PATCH_FILE))
        .collect::<Vec<_>>();
    let rollback = rollback_hint(run_id, status, tool_calls, &patch_refs);

    let mut risks = steps
        .iter()
        .flat_map(|step| step.plan.risks.iter().cloned())
        .collect::<Vec<_>>();
    risks.extend(steps.iter().flat_map(|step| step.result.failures.iter().cloned()));
    risks.extend(abort_reason.map(ToString::to_string));

    let prompts = steps
        .iter()
        .flat_map(|step| step.prompts.iter().cloned())
        .collect::<Vec<_>>();
    let checks = steps
        .last()
        .map(|step| step.result.checks.clone())
        .unwrap_or_else(StepResult::skipped_checks);

    let finalization = Finalization {
        run_id: run_id.to_string(),
        status,
        summary: summary.clone(),
        risks: risks.clone(),
        rollback: rollback.clone(),
    };
    if abort_reason.is_none() || !run.has_record(FINALIZATION_FILE) {
        run.write_record(FINALIZATION_FILE, &finalization)?;
    }

    let bundle = FinalizationBundle {
        run_id: run_id.to_string(),
        status,
        summary,
        risks,
        rollback_instructions: rollback,
        approvals: ApprovalStats::from_prompts(&prompts),
        evidence: Evidence::Run(RunEvidence {
            steps: steps.len() as u64,
            tool_calls,
            attempts,
            checks,
        }),
        generated_at: Utc::now(),
    };
    run.write_record(FINALIZATION_BUNDLE_FILE, &bundle)?;
    Ok(bundle)
}

fn rollback_hint(
    run_id: &str,
    status: RunStatus,
    tool_calls: u64,
    patch_refs: &[String],
) -> String {
    if tool_calls == 0 {
        return "No tool was invoked; nothing to roll back.".to_string();
    }
    let patches = if patch_refs.is_empty() {
        "the recorded tool outputs".to_string()
    } else {
        patch_refs.join(", ")
    };
    match status {
        RunStatus::Success => format!(
            "Revert the changes recorded in {} or record a rollback for {}.",
            patches, run_id
        ),
        _ => format!(
            "Tool calls may have left partial changes; inspect {} and {} before retrying.",
            TOOL_CALLS_FILE, patches
        ),
    }
}

// ============================================================================
// Coordinator finalization
// ============================================================================

pub fn finalize_coordination(
    run: &RunDir,
    summary: &CoordinationSummary,
) -> Result<FinalizationBundle> {
    let agents = summary.agent_runs.len() as u64;
    let succeeded = summary
        .agent_runs
        .iter()
        .filter(|agent| agent.run.status == RunStatus::Success)
        .count() as u64;
    let failed = agents - succeeded;

    let text = match summary.overall_status {
        RunStatus::Cancelled => format!(
            "Cancelled; {} of {} agent run(s) succeeded",
            succeeded, agents
        ),
        _ => format!("{} of {} agent run(s) succeeded", succeeded, agents),
    };
    let risks = summary
        .agent_runs
        .iter()
        .filter(|agent| agent.run.status != RunStatus::Success)
        .map(|agent| match &agent.error {
            Some(error) => format!("agent {}: {}", agent.agent_id, error),
            None => format!("agent {}: {}", agent.agent_id, agent.run.status),
        })
        .collect::<Vec<_>>();
    let rollback = format!(
        "Each agent run is independent; roll back runs under {}/agents individually.",
        summary.coordinator_run_id
    );

    let finalization = Finalization {
        run_id: summary.coordinator_run_id.clone(),
        status: summary.overall_status,
        summary: text.clone(),
        risks: risks.clone(),
        rollback: rollback.clone(),
    };
    run.write_record(FINALIZATION_FILE, &finalization)?;

    let bundle = FinalizationBundle {
        run_id: summary.coordinator_run_id.clone(),
        status: summary.overall_status,
        summary: text,
        risks,
        rollback_instructions: rollback,
        approvals: ApprovalStats::default(),
        evidence: Evidence::Coordination(CoordinationEvidence {
            agents,
            succeeded,
            failed,
        }),
        generated_at: Utc::now(),
    };
    run.write_record(FINALIZATION_BUNDLE_FILE, &bundle)?;
    Ok(bundle)
}
