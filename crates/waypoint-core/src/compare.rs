use std::path::Path;

use waypoint_types::DeterminismReport;

use crate::error::{OrchestratorError, Result};
use crate::store::{RunDir, MANIFEST_FILE};

const PENALTY_PER_DELTA: f64 = 0.2;

/// Tool call count and concatenated patch bytes of a run, in step order.
struct RunTrace {
    tool_calls: u64,
    patch: Vec<u8>,
}

fn read_trace(root: &Path) -> Result<RunTrace> {
    if !root.join(MANIFEST_FILE).is_file() {
        return Err(OrchestratorError::NotFound(format!(
            "no run at {}",
            root.display()
        )));
    }
    let run = RunDir::open(root);
    let mut trace = RunTrace {
        tool_calls: 0,
        patch: Vec::new(),
    };
    for step in run.step_dirs()? {
        trace.tool_calls += step.load_tool_calls()?.len() as u64;
        if let Some(bytes) = step.read_patch()? {
            trace.patch.extend_from_slice(&bytes);
        }
    }
    Ok(trace)
}

/// Structural reproducibility score for two run directories.
///
/// `diff_delta` is 0 when the patches are byte-identical and 1 otherwise;
/// `tool_call_delta` is the absolute difference in recorded calls.
pub fn compare_runs(run_a: &Path, run_b: &Path) -> Result<DeterminismReport> {
    let a = read_trace(run_a)?;
    let b = read_trace(run_b)?;

    let diff_delta = u32::from(a.patch != b.patch);
    let tool_call_delta = u32::try_from(a.tool_calls.abs_diff(b.tool_calls)).unwrap_or(u32::MAX);

    Ok(DeterminismReport {
        determinism_score: score(diff_delta, tool_call_delta),
        diff_delta,
        tool_call_delta,
    })
}

fn score(diff_delta: u32, tool_call_delta: u32) -> f64 {
    if diff_delta == 0 && tool_call_delta == 0 {
        return 1.0;
    }
    let penalty = PENALTY_PER_DELTA * (f64::from(diff_delta) + f64::from(tool_call_delta));
    (1.0 - penalty).max(0.0)
}
