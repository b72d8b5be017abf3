use chrono::Utc;

use waypoint_types::{
    RollbackAck, RollbackRecord, RunCheckpoint, RunStatus, RunSummary, StepResult, StepStatus,
    StepSummary,
};

use crate::error::{OrchestratorError, Result};
use crate::store::{CheckpointStore, RunDir, PATCH_FILE, RESULTS_FILE, ROLLBACK_FILE};

const INTERRUPTED_REASON: &str = "run was interrupted before the step completed";

/// Registry entries for every readable manifest under the store root,
/// including sub-runs nested under coordinators,
/// newest first. Unreadable manifests are skipped.
pub fn list_runs(store: &CheckpointStore) -> Result<Vec<RunCheckpoint>> {
    let mut runs = Vec::new();
    for path in store.list_all_run_dirs()? {
        match RunDir::open(&path).read_manifest() {
            Ok(manifest) => runs.push(RunCheckpoint::from(&manifest)),
            Err(e) => {
                tracing::debug!(path = %path.display(), "skipping unreadable run: {}", e);
            }
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(runs)
}

/// Rebuilds a summary from disk. A run still marked `running` ended without
/// finalizing and is reported as `failed`; nothing is rewritten.
pub fn resume_run(store: &CheckpointStore, run_id: &str) -> Result<RunSummary> {
    let run = store.open_run(run_id)?;
    let manifest = run.read_manifest()?;

    let status = if manifest.final_status == RunStatus::Running {
        tracing::warn!(run_id, "run never finalized; reporting as failed");
        RunStatus::Failed
    } else {
        manifest.final_status
    };

    let mut steps = Vec::new();
    for step in run.step_dirs()? {
        let tool_calls = step.load_tool_calls()?.len() as u64;
        let summary = match step.read_optional::<StepResult>(RESULTS_FILE)? {
            Some(result) => StepSummary {
                step_id: step.step_id().to_string(),
                status: result.status,
                attempts: result.metric("attempts"),
                tool_calls,
                failures: result.failures,
            },
            None => StepSummary {
                step_id: step.step_id().to_string(),
                status: StepStatus::Failed,
                attempts: tool_calls,
                tool_calls,
                failures: vec![INTERRUPTED_REASON.to_string()],
            },
        };
        steps.push(summary);
    }

    Ok(RunSummary {
        run_id: manifest.run_id,
        status,
        checkpoint_dir: run.path().to_path_buf(),
        steps,
    })
}

/// Records a rollback intent. Nothing on disk or elsewhere is reverted.
pub fn rollback_run(store: &CheckpointStore, run_id: &str, reason: &str) -> Result<RollbackAck> {
    let run = store.open_run(run_id)?;
    if run.has_record(ROLLBACK_FILE) {
        return Err(OrchestratorError::RollbackAlreadyRecorded(run_id.to_string()));
    }
    let manifest = run.read_manifest()?;

    let patch_refs = run
        .step_dirs()?
        .iter()
        .filter(|step| step.path().join(PATCH_FILE).is_file())
        .map(|step| format!("{}/{}", step.step_id(), PATCH_FILE))
        .collect();

    let record = RollbackRecord {
        run_id: run_id.to_string(),
        reason: reason.trim().to_string(),
        requested_at: Utc::now(),
        status_at_request: manifest.final_status,
        patch_refs,
    };
    match run.write_record(ROLLBACK_FILE, &record) {
        Ok(_) => {}
        Err(OrchestratorError::RecordExists(_)) => {
            return Err(OrchestratorError::RollbackAlreadyRecorded(run_id.to_string()));
        }
        Err(e) => return Err(e),
    }

    tracing::info!(run_id, "rollback recorded");
    Ok(RollbackAck {
        ok: true,
        run_id: run_id.to_string(),
    })
}
