// Step Executor
// Drives a run from manifest to finalization: gates, retry loop, integrity.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use waypoint_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use waypoint_tools::{Tool, ToolOutput, ToolRegistry};
use waypoint_types::{
    new_run_id, FailureKind, NextAction, RunManifest, RunStatus, RunSummary, StepResult,
    StepStatus, StepSummary, TaskRequest, ToolCall, ToolCallStatus,
};

use crate::approval;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::finalize::{self, StepRecord};
use crate::planner::{self, PlannedStep};
use crate::policy::{self, PolicyDecision, PolicyEvaluator};
use crate::store::{
    CheckpointStore, RunDir, StepDir, APPROVAL_PROMPTS_FILE, PLAN_FILE, REQUIREMENTS_FILE,
    RESULTS_FILE,
};

pub(crate) const PROCESS: ProcessKind = ProcessKind::Core;
const COMPONENT: &str = "orchestrator.executor";
const CANCELLED_REASON: &str = "cancelled";

/// Executes single runs. Cheap to clone; clones share config, tools and policy.
#[derive(Clone)]
pub struct StepExecutor {
    config: Arc<OrchestratorConfig>,
    tools: ToolRegistry,
    policy: Arc<dyn PolicyEvaluator>,
}

/// Outcome of the retry loop for one step.
struct AttemptOutcome {
    attempts: u32,
    success: Option<ToolOutput>,
    last_failure: Option<String>,
    cancelled: bool,
}

impl StepExecutor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        tools: ToolRegistry,
        policy: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        Self {
            config,
            tools,
            policy,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Runs a task to a terminal status under `store`.
    ///
    /// Gate rejections and tool failures are reported through the returned
    /// summary. Only storage failures and invalid requests are errors; a run
    /// interrupted by a storage failure is still finalized as `failed` where
    /// the store allows it.
    pub async fn execute(
        &self,
        store: &CheckpointStore,
        request: TaskRequest,
        parent_run_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.execute_planned(store, request, parent_run_id, cancel, planner::plan_steps)
            .await
    }

    /// Same as [`StepExecutor::execute`] with the step sequence built by `plan`
    /// from `(run_id, request, tool, policy_version)`.
    pub(crate) async fn execute_planned<P>(
        &self,
        store: &CheckpointStore,
        request: TaskRequest,
        parent_run_id: Option<String>,
        cancel: CancellationToken,
        plan: P,
    ) -> Result<RunSummary>
    where
        P: FnOnce(&str, &TaskRequest, &str, &str) -> Vec<PlannedStep>,
    {
        if request.goal.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "goal must not be empty".to_string(),
            ));
        }

        let run_id = new_run_id();
        let task_type = request.task_type();
        let tool_name = self.config.resolve_tool(task_type, request.tool.as_deref());

        let mut manifest = RunManifest::new(
            run_id.clone(),
            task_type,
            self.config.model.clone(),
            self.config.policy.version.clone(),
        );
        manifest.repo_snapshot = request.repo_snapshot.clone();
        manifest.parent_run_id = parent_run_id;

        let run = store.create_run(&manifest)?;
        if let Err(err) = run.write_record(REQUIREMENTS_FILE, &request) {
            abandon_run(&run, &run_id, &[], &err);
            return Err(err);
        }

        let redacted_goal = redact_text(&request.goal);
        tracing::info!(run_id = %run_id, task_type, tool = %tool_name, "run started");
        emit_event(
            Level::INFO,
            PROCESS,
            ObservabilityEvent::new("run.started", COMPONENT)
                .run(&run_id)
                .tool(&tool_name)
                .status(RunStatus::Running.as_str())
                .detail(&redacted_goal),
        );

        let steps = plan(&run_id, &request, &tool_name, &self.config.policy.version);

        let mut records: Vec<StepRecord> = Vec::with_capacity(steps.len());
        let mut previous_hash: Option<String> = None;
        for planned in steps {
            let step = self
                .execute_step(&run, &planned, &tool_name, previous_hash.take(), &cancel)
                .await;
            let record = match step {
                Ok(record) => record,
                Err(err) => {
                    abandon_run(&run, &run_id, &records, &err);
                    return Err(err);
                }
            };
            previous_hash = Some(record.integrity.content_hash.clone());
            let status = record.result.status;
            records.push(record);
            if status != StepStatus::Success {
                break;
            }
        }

        let status = records
            .last()
            .map(|record| RunStatus::from(record.result.status))
            .unwrap_or(RunStatus::Failed);

        if let Err(err) = finalize::finalize_run(&run, &run_id, status, &records) {
            abandon_run(&run, &run_id, &records, &err);
            return Err(err);
        }
        run.finalize_manifest(status, Utc::now())?;

        let level = if status == RunStatus::Success {
            Level::INFO
        } else {
            Level::WARN
        };
        emit_event(
            level,
            PROCESS,
            ObservabilityEvent::new("run.finalized", COMPONENT)
                .run(&run_id)
                .tool(&tool_name)
                .status(status.as_str()),
        );
        tracing::info!(run_id = %run_id, status = %status, "run finalized");

        Ok(RunSummary {
            run_id,
            status,
            checkpoint_dir: run.path().to_path_buf(),
            steps: records.iter().map(step_summary).collect(),
        })
    }

    async fn execute_step(
        &self,
        run: &RunDir,
        planned: &PlannedStep,
        tool_name: &str,
        previous_hash: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<StepRecord> {
        let plan = &planned.plan;
        let step = run.step(&plan.step_id)?;
        step.write_record(PLAN_FILE, plan)?;
        if !planned.prompts.is_empty() {
            step.write_record(APPROVAL_PROMPTS_FILE, &planned.prompts)?;
        }

        let result = self
            .run_gates_and_attempts(&step, planned, tool_name, cancel)
            .await?;
        step.write_record(RESULTS_FILE, &result)?;
        let integrity = finalize::write_integrity(&step, previous_hash)?;

        Ok(StepRecord {
            plan: plan.clone(),
            prompts: planned.prompts.clone(),
            result,
            integrity,
        })
    }

    async fn run_gates_and_attempts(
        &self,
        step: &StepDir,
        planned: &PlannedStep,
        tool_name: &str,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        let plan = &planned.plan;
        let run_id = plan.run_id.as_str();

        // Approval gate
        let pending = approval::pending(&planned.prompts);
        if !pending.is_empty() {
            tracing::warn!(
                run_id,
                step_id = %plan.step_id,
                pending = pending.len(),
                "step blocked on approvals"
            );
            emit_event(
                Level::WARN,
                PROCESS,
                ObservabilityEvent::new("step.blocked", COMPONENT)
                    .run(run_id)
                    .step(&plan.step_id)
                    .status(StepStatus::Blocked.as_str())
                    .error_code("approval_required"),
            );
            let mut result = gate_result(
                &plan.step_id,
                StepStatus::Blocked,
                FailureKind::ApprovalRequired,
                pending.iter().map(approval::pending_reason).collect(),
            );
            result.next_action = Some(NextAction::ApprovalRequired);
            result
                .metrics
                .insert("pending_approvals".to_string(), pending.len() as u64);
            return Ok(result);
        }

        if cancel.is_cancelled() {
            return Ok(gate_result(
                &plan.step_id,
                StepStatus::Cancelled,
                FailureKind::Cancelled,
                vec![CANCELLED_REASON.to_string()],
            ));
        }

        let Some(tool) = self.tools.get(tool_name) else {
            tracing::warn!(run_id, tool = tool_name, "tool is not registered");
            emit_event(
                Level::WARN,
                PROCESS,
                ObservabilityEvent::new("step.failed", COMPONENT)
                    .run(run_id)
                    .step(&plan.step_id)
                    .tool(tool_name)
                    .error_code("tool_unavailable"),
            );
            return Ok(gate_result(
                &plan.step_id,
                StepStatus::Failed,
                FailureKind::ToolUnavailable,
                vec![format!("tool `{}` is not registered", tool_name)],
            ));
        };

        // Policy gate
        let command = &plan.policy_context.intended_command;
        let verdict =
            policy::evaluate_command(self.policy.as_ref(), &self.config.policy, command).await;
        if !verdict.is_allowed() {
            let reason = if verdict.reason.trim().is_empty() {
                format!("policy decision: {}", verdict.decision.as_str())
            } else {
                verdict.reason
            };
            tracing::warn!(run_id, step_id = %plan.step_id, "policy blocked step: {}", reason);
            emit_event(
                Level::WARN,
                PROCESS,
                ObservabilityEvent::new("step.blocked", COMPONENT)
                    .run(run_id)
                    .step(&plan.step_id)
                    .tool(tool_name)
                    .status(StepStatus::Blocked.as_str())
                    .error_code("policy_rejected")
                    .detail(&reason),
            );
            let mut result = gate_result(
                &plan.step_id,
                StepStatus::Blocked,
                FailureKind::PolicyRejected,
                vec![reason],
            );
            // A denial is final; only a require_approval verdict can be signed off.
            if verdict.decision == PolicyDecision::RequireApproval {
                result.next_action = Some(NextAction::ApprovalRequired);
            }
            return Ok(result);
        }

        let outcome = self.attempt_loop(step, planned, tool, cancel).await?;
        step.write_patch(&placeholder_patch(plan))?;

        let mut checks = StepResult::skipped_checks();
        let ending = (&outcome.success, outcome.cancelled);
        let (status, failures, failure_kind, next_action) = match ending {
            (Some(output), _) => {
                checks.extend(output.checks.clone());
                (StepStatus::Success, Vec::new(), None, None)
            }
            (None, true) => (
                StepStatus::Cancelled,
                vec![CANCELLED_REASON.to_string()],
                Some(FailureKind::Cancelled),
                None,
            ),
            (None, false) => (
                StepStatus::Failed,
                outcome.last_failure.clone().into_iter().collect(),
                Some(FailureKind::ToolExecutionFailure),
                Some(NextAction::Repair),
            ),
        };

        let mut metrics = BTreeMap::new();
        metrics.insert("attempts".to_string(), u64::from(outcome.attempts));
        metrics.insert("tool_calls".to_string(), u64::from(outcome.attempts));
        metrics.insert("pending_approvals".to_string(), 0);

        Ok(StepResult {
            step_id: plan.step_id.clone(),
            status,
            checks,
            failures,
            failure_kind,
            metrics,
            next_action,
            completed_at: Utc::now(),
        })
    }

    /// Sequential attempts, bounded by the attempt budget. Stops on the first
    /// exit code 0. Each attempt is appended to the tool call log as soon as it
    /// ends.
    async fn attempt_loop(
        &self,
        step: &StepDir,
        planned: &PlannedStep,
        tool: Arc<dyn Tool>,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let plan = &planned.plan;
        let budget = self.config.attempt_budget();
        let artifact_dir = step.artifact_dir();
        let mut outcome = AttemptOutcome {
            attempts: 0,
            success: None,
            last_failure: None,
            cancelled: false,
        };

        while outcome.attempts < budget {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            outcome.attempts += 1;
            let attempt = outcome.attempts;

            let args = json!({
                "goal": plan.goal,
                "attempt": attempt,
                "seed": plan.seed,
                "run_id": plan.run_id,
                "step_id": plan.step_id,
                "artifact_dir": artifact_dir.display().to_string(),
            });

            let started_at = Utc::now();
            let result = tool.execute_with_cancel(args.clone(), cancel.clone()).await;
            let ended_at = Utc::now();

            let mut call = ToolCall {
                id: format!("call-{}", Uuid::new_v4()),
                step_id: plan.step_id.clone(),
                tool: plan.policy_context.tool.clone(),
                attempt,
                args,
                started_at,
                ended_at,
                exit_code: None,
                status: ToolCallStatus::Error,
                output_ref: None,
                error: None,
            };

            match result {
                Ok(output) => {
                    call.exit_code = Some(output.exit_code);
                    call.output_ref = output.output_ref.clone();
                    if output.is_success() {
                        call.status = ToolCallStatus::Success;
                        outcome.success = Some(output);
                    } else {
                        let reason = format!(
                            "tool `{}` exited with code {}",
                            call.tool, output.exit_code
                        );
                        call.error = Some(reason.clone());
                        outcome.last_failure = Some(reason);
                    }
                }
                Err(err) => {
                    call.exit_code = Some(1);
                    let reason = if cancel.is_cancelled() {
                        outcome.cancelled = true;
                        CANCELLED_REASON.to_string()
                    } else {
                        err.to_string()
                    };
                    call.error = Some(reason.clone());
                    outcome.last_failure = Some(reason);
                }
            }

            step.append_tool_call(&call)?;

            if outcome.success.is_some() || outcome.cancelled {
                break;
            }

            tracing::warn!(
                run_id = %plan.run_id,
                step_id = %plan.step_id,
                tool = %call.tool,
                attempt,
                budget,
                "attempt failed: {}",
                call.error.as_deref().unwrap_or("")
            );
            emit_event(
                Level::WARN,
                PROCESS,
                ObservabilityEvent::new("attempt.failed", COMPONENT)
                    .run(&plan.run_id)
                    .step(&plan.step_id)
                    .tool(&call.tool)
                    .error_code("tool_execution_failure")
                    .detail(call.error.as_deref().unwrap_or("")),
            );
        }

        Ok(outcome)
    }
}

/// Best-effort terminal records for a run whose execution hit a storage error.
fn abandon_run(run: &RunDir, run_id: &str, records: &[StepRecord], err: &OrchestratorError) {
    let reason = format!("run aborted: {}", err);
    tracing::error!(run_id, "{}", reason);
    emit_event(
        Level::ERROR,
        PROCESS,
        ObservabilityEvent::new("run.aborted", COMPONENT)
            .run(run_id)
            .status(RunStatus::Failed.as_str())
            .error_code("storage")
            .detail(&reason),
    );
    if let Err(e) = finalize::finalize_aborted_run(run, run_id, records, &reason) {
        tracing::warn!(run_id, "could not finalize aborted run: {}", e);
    }
    if let Err(e) = run.finalize_manifest(RunStatus::Failed, Utc::now()) {
        tracing::warn!(run_id, "could not mark aborted run as failed: {}", e);
    }
}

fn gate_result(
    step_id: &str,
    status: StepStatus,
    kind: FailureKind,
    failures: Vec<String>,
) -> StepResult {
    let mut metrics = BTreeMap::new();
    metrics.insert("attempts".to_string(), 0);
    metrics.insert("tool_calls".to_string(), 0);
    metrics.insert("pending_approvals".to_string(), 0);
    StepResult {
        step_id: step_id.to_string(),
        status,
        checks: StepResult::skipped_checks(),
        failures,
        failure_kind: Some(kind),
        metrics,
        next_action: None,
        completed_at: Utc::now(),
    }
}

/// Stands in for the edit payload a tool would produce.
fn placeholder_patch(plan: &waypoint_types::StepPlan) -> String {
    format!(
        "# waypoint patch placeholder\n# run: {}\n# step: {}\n# seed: {}\n",
        plan.run_id, plan.step_id, plan.seed
    )
}

pub(crate) fn step_summary(record: &StepRecord) -> StepSummary {
    StepSummary {
        step_id: record.plan.step_id.clone(),
        status: record.result.status,
        attempts: record.attempts(),
        tool_calls: record.tool_calls(),
        failures: record.result.failures.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::StaticPolicyEvaluator;
    use crate::store::{FINALIZATION_BUNDLE_FILE, INTEGRITY_FILE, PATCH_FILE, TOOL_CALLS_FILE};
    use waypoint_types::{FinalizationBundle, IntegrityRecord};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use waypoint_tools::{EchoTool, FnTool};

    fn executor(tools: ToolRegistry, max_retries: u32) -> StepExecutor {
        let config = OrchestratorConfig::default().with_max_retries(max_retries);
        StepExecutor::new(
            Arc::new(config),
            tools,
            Arc::new(StaticPolicyEvaluator::allow()),
        )
    }

    #[tokio::test]
    async fn empty_goal_is_rejected() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let exec = executor(ToolRegistry::default(), 3);
        let err = exec
            .execute(&store, TaskRequest::new("  "), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
        assert!(store.list_run_dirs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn thrown_errors_are_recorded_as_exit_code_one() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let tools = ToolRegistry::builder()
            .register_as(
                "echo",
                Arc::new(FnTool::new("boom", move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<ToolOutput, _>(anyhow::anyhow!("disk full"))
                    }
                })),
            )
            .build();

        let summary = executor(tools, 2)
            .execute(&store, TaskRequest::new("write file"), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let step = RunDir::open(&summary.checkpoint_dir).step("step-1").unwrap();
        let recorded = step.load_tool_calls().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded
            .iter()
            .all(|call| call.exit_code == Some(1) && call.status == ToolCallStatus::Error));
        let result: StepResult = step.read_record(RESULTS_FILE).unwrap();
        assert_eq!(result.failures, vec!["disk full".to_string()]);
        assert_eq!(result.next_action, Some(NextAction::Repair));
    }

    #[tokio::test]
    async fn successful_checks_are_merged_over_skips() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let tools = ToolRegistry::builder()
            .register(Arc::new(FnTool::new("echo", |_| async {
                Ok::<_, anyhow::Error>(
                    ToolOutput::success().with_check("test", waypoint_types::CheckStatus::Pass),
                )
            })))
            .build();

        let summary = executor(tools, 1)
            .execute(&store, TaskRequest::new("run tests"), None, CancellationToken::new())
            .await
            .unwrap();

        let step = RunDir::open(&summary.checkpoint_dir).step("step-1").unwrap();
        let result: StepResult = step.read_record(RESULTS_FILE).unwrap();
        assert_eq!(result.checks["test"], waypoint_types::CheckStatus::Pass);
        assert_eq!(result.checks["lint"], waypoint_types::CheckStatus::Skip);
    }

    #[tokio::test]
    async fn missing_tool_fails_without_calls() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let tools = ToolRegistry::builder().register(Arc::new(EchoTool)).build();

        let summary = executor(tools, 3)
            .execute(
                &store,
                TaskRequest::new("deploy").with_tool("kubectl"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        let step = RunDir::open(&summary.checkpoint_dir).step("step-1").unwrap();
        assert!(!step.path().join(TOOL_CALLS_FILE).exists());
        let result: StepResult = step.read_record(RESULTS_FILE).unwrap();
        assert_eq!(result.failure_kind, Some(FailureKind::ToolUnavailable));
        assert_eq!(result.failures, vec!["tool `kubectl` is not registered".to_string()]);
        assert!(result.next_action.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_records_no_calls() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let tools = ToolRegistry::builder().register(Arc::new(EchoTool)).build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = executor(tools, 3)
            .execute(&store, TaskRequest::new("anything"), None, cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.steps[0].tool_calls, 0);
        let manifest = RunDir::open(&summary.checkpoint_dir).read_manifest().unwrap();
        assert_eq!(manifest.final_status, RunStatus::Cancelled);
    }

    fn three_steps(
        run_id: &str,
        request: &TaskRequest,
        tool: &str,
        policy_version: &str,
    ) -> Vec<PlannedStep> {
        (1..=3)
            .map(|n| planner::plan_step(run_id, request, tool, policy_version, n))
            .collect()
    }

    #[tokio::test]
    async fn multi_step_runs_chain_integrity_hashes() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let tools = ToolRegistry::builder().register(Arc::new(EchoTool)).build();

        let summary = executor(tools, 1)
            .execute_planned(
                &store,
                TaskRequest::new("migrate schema"),
                None,
                CancellationToken::new(),
                three_steps,
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.steps.len(), 3);

        let run = RunDir::open(&summary.checkpoint_dir);
        let chain = run
            .step_dirs()
            .unwrap()
            .iter()
            .map(|step| step.read_record::<IntegrityRecord>(INTEGRITY_FILE).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chain.len(), 3);
        assert!(chain[0].previous_hash.is_none());
        assert_eq!(
            chain[1].previous_hash.as_deref(),
            Some(chain[0].content_hash.as_str())
        );
        assert_eq!(
            chain[2].previous_hash.as_deref(),
            Some(chain[1].content_hash.as_str())
        );
    }

    #[tokio::test]
    async fn execution_stops_at_the_first_unsuccessful_step() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        let tools = ToolRegistry::builder()
            .register(Arc::new(FnTool::new("echo", |args: serde_json::Value| async move {
                if args["step_id"] == "step-2" {
                    Ok::<_, anyhow::Error>(ToolOutput::exit(4))
                } else {
                    Ok(ToolOutput::success())
                }
            })))
            .build();

        let summary = executor(tools, 2)
            .execute_planned(
                &store,
                TaskRequest::new("migrate schema"),
                None,
                CancellationToken::new(),
                three_steps,
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        let ids = summary
            .steps
            .iter()
            .map(|step| (step.step_id.as_str(), step.status))
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![("step-1", StepStatus::Success), ("step-2", StepStatus::Failed)]
        );
        assert!(!summary.checkpoint_dir.join("step-3").exists());

        let resumed = crate::registry::resume_run(&store, &summary.run_id).unwrap();
        assert_eq!(resumed.steps, summary.steps);
    }

    #[tokio::test]
    async fn storage_failure_mid_step_still_finalizes_the_run() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path()).unwrap();
        // Leaving a patch behind makes the write-once patch record fail.
        let tools = ToolRegistry::builder()
            .register(Arc::new(FnTool::new("echo", |args: serde_json::Value| async move {
                let artifact_dir = args["artifact_dir"].as_str().unwrap_or_default().to_string();
                let stale = std::path::Path::new(&artifact_dir).join("..").join(PATCH_FILE);
                if let Err(e) = std::fs::write(stale, "stale") {
                    return Err(anyhow::Error::from(e));
                }
                Ok(ToolOutput::success())
            })))
            .build();

        let err = executor(tools, 1)
            .execute(&store, TaskRequest::new("edit"), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RecordExists(_)));

        let run_dir = store.list_run_dirs().unwrap().remove(0);
        let run = RunDir::open(&run_dir);
        assert_eq!(run.read_manifest().unwrap().final_status, RunStatus::Failed);
        let bundle: FinalizationBundle = run.read_record(FINALIZATION_BUNDLE_FILE).unwrap();
        assert_eq!(bundle.status, RunStatus::Failed);
        assert!(bundle.summary.contains("run aborted"));
    }

    #[test]
    fn placeholder_patch_names_run_and_seed() {
        let steps = planner::plan_steps("run-9", &TaskRequest::new("g"), "echo", "v1");
        let patch = placeholder_patch(&steps[0].plan);
        assert!(patch.contains("run-9"));
        assert!(patch.contains(&planner::deterministic_seed("g")));
    }
}
