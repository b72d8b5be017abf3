// Checkpoint Store
// Run-scoped, write-once persistence for manifests, plans, tool calls and results.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use waypoint_types::{RunManifest, RunStatus, ToolCall};

use crate::error::{OrchestratorError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REQUIREMENTS_FILE: &str = "requirements.json";
pub const FINALIZATION_FILE: &str = "finalization.json";
pub const FINALIZATION_BUNDLE_FILE: &str = "finalization_bundle.json";
pub const ROLLBACK_FILE: &str = "rollback.json";
pub const COORDINATION_FILE: &str = "coordination.json";
pub const PLAN_FILE: &str = "plan.json";
pub const APPROVAL_PROMPTS_FILE: &str = "approval_prompts.json";
pub const TOOL_CALLS_FILE: &str = "tool_calls.jsonl";
pub const RESULTS_FILE: &str = "results.json";
pub const INTEGRITY_FILE: &str = "integrity.json";
pub const PATCH_FILE: &str = "patch.diff";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const AGENTS_DIR: &str = "agents";

// ============================================================================
// Checkpoint Store
// ============================================================================

/// Root directory holding one subdirectory per run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to create checkpoint root: {}", e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Creates the run directory and writes the initial manifest.
    pub fn create_run(&self, manifest: &RunManifest) -> Result<RunDir> {
        let path = self.run_dir(&manifest.run_id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(OrchestratorError::RecordExists(path.display().to_string()));
            }
            Err(e) => {
                return Err(OrchestratorError::IoError(format!(
                    "Failed to create run directory: {}",
                    e
                )));
            }
        }
        let run = RunDir::open(path);
        run.write_record(MANIFEST_FILE, manifest)?;
        Ok(run)
    }

    /// Opens a top-level run, or a sub-run stored under a coordinator's
    /// `agents/` directory.
    pub fn open_run(&self, run_id: &str) -> Result<RunDir> {
        validate_run_id(run_id)?;
        let path = self.run_dir(run_id);
        if path.join(MANIFEST_FILE).is_file() {
            return Ok(RunDir::open(path));
        }
        for coordinator in self.list_run_dirs()? {
            let nested = coordinator.join(AGENTS_DIR).join(run_id);
            if nested.join(MANIFEST_FILE).is_file() {
                return Ok(RunDir::open(nested));
            }
        }
        Err(OrchestratorError::NotFound(format!("run {}", run_id)))
    }

    /// Immediate subdirectories of the root.
    pub fn list_run_dirs(&self) -> Result<Vec<PathBuf>> {
        subdirectories(&self.root)
    }

    /// Top-level run directories followed by the sub-runs nested under each
    /// coordinator's `agents/` directory.
    pub fn list_all_run_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut runs = Vec::new();
        for path in self.list_run_dirs()? {
            let nested = subdirectories(&path.join(AGENTS_DIR))?;
            runs.push(path);
            runs.extend(nested);
        }
        Ok(runs)
    }
}

// ============================================================================
// Run Directory
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        write_once_json(&self.path.join(name), value)
    }

    pub fn read_record<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        read_json(&self.path.join(name))
    }

    pub fn read_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path.join(name);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn has_record(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }

    pub fn read_manifest(&self) -> Result<RunManifest> {
        self.read_record(MANIFEST_FILE)
    }

    /// The only in-place rewrite the store permits: attach the terminal
    /// status and end time to the manifest.
    pub fn finalize_manifest(
        &self,
        status: RunStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<RunManifest> {
        let mut manifest = self.read_manifest()?;
        if manifest.final_status.is_terminal() {
            return Err(OrchestratorError::RecordExists(format!(
                "{} already finalized as {}",
                manifest.run_id, manifest.final_status
            )));
        }
        manifest.final_status = status;
        manifest.ended_at = Some(ended_at);
        let content = serde_json::to_string_pretty(&manifest)?;
        atomic_write(&self.path.join(MANIFEST_FILE), &content)?;
        Ok(manifest)
    }

    /// Creates (or reopens) the directory for a step.
    pub fn step(&self, step_id: &str) -> Result<StepDir> {
        let path = self.path.join(step_id);
        fs::create_dir_all(path.join(ARTIFACTS_DIR)).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to create step directory: {}", e))
        })?;
        Ok(StepDir {
            step_id: step_id.to_string(),
            path,
        })
    }

    /// Existing step directories (those holding a plan), in plan sequence order.
    pub fn step_dirs(&self) -> Result<Vec<StepDir>> {
        let mut steps = Vec::new();
        if !self.path.exists() {
            return Ok(steps);
        }
        for entry in fs::read_dir(&self.path).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to read run directory: {}", e))
        })? {
            let entry = entry.map_err(|e| {
                OrchestratorError::IoError(format!("Failed to read directory entry: {}", e))
            })?;
            let path = entry.path();
            if !path.join(PLAN_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                steps.push(StepDir {
                    step_id: name.to_string(),
                    path,
                });
            }
        }
        steps.sort_by_cached_key(step_order);
        Ok(steps)
    }
}

#[derive(Deserialize)]
struct PlanOrder {
    #[serde(default)]
    sequence: Option<u32>,
}

/// The plan's `sequence`, else the numeric suffix of `step-<n>`.
fn step_order(step: &StepDir) -> (u32, String) {
    let sequence = read_json::<PlanOrder>(&step.path.join(PLAN_FILE))
        .ok()
        .and_then(|plan| plan.sequence)
        .or_else(|| step.step_id.rsplit('-').next().and_then(|n| n.parse().ok()))
        .unwrap_or(u32::MAX);
    (sequence, step.step_id.clone())
}

// ============================================================================
// Step Directory
// ============================================================================

#[derive(Debug, Clone)]
pub struct StepDir {
    step_id: String,
    path: PathBuf,
}

impl StepDir {
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.path.join(ARTIFACTS_DIR)
    }

    pub fn write_record<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        write_once_json(&self.path.join(name), value)
    }

    pub fn read_record<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        read_json(&self.path.join(name))
    }

    pub fn read_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path.join(name);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Appends one attempt to `tool_calls.jsonl`.
    pub fn append_tool_call(&self, call: &ToolCall) -> Result<()> {
        let path = self.path.join(TOOL_CALLS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                OrchestratorError::IoError(format!("Failed to open tool call log: {}", e))
            })?;

        let line = serde_json::to_string(call)?;
        writeln!(file, "{}", line)
            .map_err(|e| OrchestratorError::IoError(format!("Failed to write tool call: {}", e)))?;
        file.sync_data()
            .map_err(|e| {
                OrchestratorError::IoError(format!("Failed to sync tool call log: {}", e))
            })?;
        Ok(())
    }

    /// Tool calls in attempt order. Lines that fail to parse are skipped.
    pub fn load_tool_calls(&self) -> Result<Vec<ToolCall>> {
        let path = self.path.join(TOOL_CALLS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| {
                OrchestratorError::IoError(format!("Failed to open tool call log: {}", e))
            })?;
        let reader = BufReader::new(file);
        let mut calls = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| {
                OrchestratorError::IoError(format!("Failed to read tool call log line: {}", e))
            })?;
            if let Ok(call) = serde_json::from_str(&line) {
                calls.push(call);
            }
        }
        Ok(calls)
    }

    pub fn write_patch(&self, content: &str) -> Result<PathBuf> {
        let path = self.path.join(PATCH_FILE);
        ensure_absent(&path)?;
        atomic_write(&path, content)?;
        Ok(path)
    }

    pub fn read_patch(&self) -> Result<Option<Vec<u8>>> {
        let path = self.path.join(PATCH_FILE);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|e| OrchestratorError::IoError(format!("Failed to read patch: {}", e)))
    }
}

/// Run ids name a single directory under the root: no separators, no `.`/`..`.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let mut components = Path::new(run_id).components();
    let single_name = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name.to_str() == Some(run_id)
    );
    if !single_name || run_id.contains(['/', '\\']) {
        return Err(OrchestratorError::InvalidRequest(format!(
            "invalid run id `{}`",
            run_id
        )));
    }
    Ok(())
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| {
        OrchestratorError::IoError(format!("Failed to read {}: {}", dir.display(), e))
    })? {
        let entry = entry.map_err(|e| {
            OrchestratorError::IoError(format!("Failed to read directory entry: {}", e))
        })?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn ensure_absent(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(OrchestratorError::RecordExists(path.display().to_string()));
    }
    Ok(())
}

fn write_once_json<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    ensure_absent(path)?;
    let content = serde_json::to_string_pretty(value)?;
    atomic_write(path, &content)?;
    Ok(path.to_path_buf())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::IoError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        OrchestratorError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .map_err(|e| OrchestratorError::IoError(format!("Failed to write temp file: {}", e)))?;

    fs::rename(&temp_path, path)
        .map_err(|e| OrchestratorError::IoError(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use waypoint_types::ToolCallStatus;

    fn manifest(run_id: &str) -> RunManifest {
        RunManifest::new(run_id, "generic", "test-model", "v1")
    }

    fn tool_call(step_id: &str, attempt: u32) -> ToolCall {
        let now = Utc::now();
        ToolCall {
            id: format!("{}-call-{}", step_id, attempt),
            step_id: step_id.to_string(),
            tool: "echo".to_string(),
            attempt,
            args: json!({ "attempt": attempt }),
            started_at: now,
            ended_at: now,
            exit_code: Some(0),
            status: ToolCallStatus::Success,
            output_ref: None,
            error: None,
        }
    }

    #[test]
    fn create_run_writes_manifest_once() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path().join("runs")).unwrap();

        let run = store.create_run(&manifest("run_1")).unwrap();
        assert!(run.path().join(MANIFEST_FILE).is_file());

        let again = store.create_run(&manifest("run_1"));
        assert!(matches!(again, Err(OrchestratorError::RecordExists(_))));
    }

    #[test]
    fn records_are_write_once() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();

        run.write_record(REQUIREMENTS_FILE, &json!({ "goal": "a" }))
            .unwrap();
        let second = run.write_record(REQUIREMENTS_FILE, &json!({ "goal": "b" }));
        assert!(matches!(second, Err(OrchestratorError::RecordExists(_))));

        let stored: serde_json::Value = run.read_record(REQUIREMENTS_FILE).unwrap();
        assert_eq!(stored["goal"], "a");
    }

    #[test]
    fn finalize_manifest_only_once() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();

        let finalized = run.finalize_manifest(RunStatus::Success, Utc::now()).unwrap();
        assert_eq!(finalized.final_status, RunStatus::Success);
        assert!(finalized.ended_at.is_some());
        assert_eq!(run.read_manifest().unwrap().final_status, RunStatus::Success);

        let again = run.finalize_manifest(RunStatus::Failed, Utc::now());
        assert!(matches!(again, Err(OrchestratorError::RecordExists(_))));
    }

    #[test]
    fn tool_calls_append_in_order_and_skip_garbage() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();
        let step = run.step("step-1").unwrap();

        step.append_tool_call(&tool_call("step-1", 1)).unwrap();
        step.append_tool_call(&tool_call("step-1", 2)).unwrap();
        let mut log = OpenOptions::new()
            .append(true)
            .open(step.path().join(TOOL_CALLS_FILE))
            .unwrap();
        writeln!(log, "not json").unwrap();

        let calls = step.load_tool_calls().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].attempt, 1);
        assert_eq!(calls[1].attempt, 2);
    }

    #[test]
    fn patch_is_write_once() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();
        let step = run.step("step-1").unwrap();

        assert!(step.read_patch().unwrap().is_none());
        step.write_patch("--- a\n+++ b\n").unwrap();
        assert!(step.write_patch("other").is_err());
        assert_eq!(step.read_patch().unwrap().unwrap(), b"--- a\n+++ b\n");
    }

    #[test]
    fn step_dirs_require_a_plan() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();

        let planned = run.step("step-1").unwrap();
        planned.write_record(PLAN_FILE, &json!({})).unwrap();
        run.step("step-2").unwrap();

        let steps = run.step_dirs().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_id(), "step-1");
    }

    #[test]
    fn step_dirs_follow_plan_sequence() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let run = store.create_run(&manifest("run_1")).unwrap();

        for n in [10, 2, 1] {
            let step = run.step(&format!("step-{}", n)).unwrap();
            step.write_record(PLAN_FILE, &json!({ "sequence": n })).unwrap();
        }

        let ids = run
            .step_dirs()
            .unwrap()
            .iter()
            .map(|s| s.step_id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["step-1", "step-2", "step-10"]);
    }

    #[test]
    fn run_ids_cannot_leave_the_root() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path().join("runs")).unwrap();

        // a run-shaped directory next to the root
        let outside = temp.path().join("elsewhere");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join(MANIFEST_FILE), "{}").unwrap();

        for id in ["../elsewhere", "a/b", "a\\b", "..", ".", "", "/tmp/run-x"] {
            assert!(
                matches!(store.open_run(id), Err(OrchestratorError::InvalidRequest(_))),
                "accepted {:?}",
                id
            );
        }
        assert!(validate_run_id("run-3f2a").is_ok());
    }

    #[test]
    fn sub_runs_open_by_id_and_are_listed() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let coordinator = store.create_run(&manifest("run-coord")).unwrap();
        let agents = CheckpointStore::new(coordinator.path().join(AGENTS_DIR)).unwrap();
        agents.create_run(&manifest("run-sub")).unwrap();

        let sub = store.open_run("run-sub").unwrap();
        assert_eq!(sub.path(), coordinator.path().join(AGENTS_DIR).join("run-sub"));

        let all = store.list_all_run_dirs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.list_run_dirs().unwrap().len(), 1);
    }

    #[test]
    fn list_run_dirs_ignores_files() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        store.create_run(&manifest("run_1")).unwrap();
        store.create_run(&manifest("run_2")).unwrap();
        std::fs::write(temp.path().join("some_file"), "content").unwrap();

        let runs = store.list_run_dirs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.contains(&temp.path().join("run_1")));
    }

    #[test]
    fn open_run_reports_missing_runs() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.open_run("nope"),
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
