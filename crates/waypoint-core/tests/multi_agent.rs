use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use waypoint_core::store::{COORDINATION_FILE, FINALIZATION_BUNDLE_FILE, ROLLBACK_FILE};
use waypoint_core::{Orchestrator, OrchestratorConfig, OrchestratorError};
use waypoint_tools::{FnTool, ToolOutput};
use waypoint_types::{
    AgentProfile, CoordinationSummary, Evidence, FinalizationBundle, MultiAgentRequest, RunStatus,
};

fn config(temp: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_checkpoint_root(temp.path().join("runs"))
        .with_max_retries(2)
}

fn request(agents: &[(&str, &str)]) -> MultiAgentRequest {
    MultiAgentRequest {
        goal: "prepare release".to_string(),
        acceptance_criteria: vec!["changelog updated".to_string()],
        agents: agents
            .iter()
            .map(|(id, focus)| AgentProfile::new(*id, *focus))
            .collect(),
        high_risk_actions: Vec::new(),
        tool: None,
    }
}

fn goal_of(args: &Value) -> String {
    args.get("goal")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn one_failing_agent_fails_the_coordinator() {
    let temp = tempdir().unwrap();
    let orchestrator = Orchestrator::builder(config(&temp))
        .register_tool(Arc::new(FnTool::new("echo", |args: Value| async move {
            if goal_of(&args).contains("agent qa:") {
                Ok::<_, anyhow::Error>(ToolOutput::exit(1))
            } else {
                Ok(ToolOutput::success())
            }
        })))
        .build()
        .unwrap();

    let summary = orchestrator
        .run_multi_agent_task(request(&[("docs", "docs"), ("qa", "tests"), ("api", "api")]))
        .await
        .unwrap();

    assert_eq!(summary.overall_status, RunStatus::Failed);
    assert_eq!(summary.agent_runs.len(), 3);
    let statuses = summary
        .agent_runs
        .iter()
        .map(|a| (a.agent_id.as_str(), a.run.status))
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![
            ("docs", RunStatus::Success),
            ("qa", RunStatus::Failed),
            ("api", RunStatus::Success)
        ]
    );

    let persisted: CoordinationSummary = serde_json::from_str(
        &std::fs::read_to_string(summary.checkpoint_dir.join(COORDINATION_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted.agent_runs.len(), 3);

    let bundle: FinalizationBundle = serde_json::from_str(
        &std::fs::read_to_string(summary.checkpoint_dir.join(FINALIZATION_BUNDLE_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(bundle.status, RunStatus::Failed);
    assert_eq!(
        (bundle.approvals.required, bundle.approvals.granted, bundle.approvals.pending),
        (0, 0, 0)
    );
    match bundle.evidence {
        Evidence::Coordination(evidence) => {
            assert_eq!((evidence.agents, evidence.succeeded, evidence.failed), (3, 2, 1));
        }
        other => panic!("unexpected evidence {:?}", other),
    }
}

#[tokio::test]
async fn sub_runs_execute_concurrently() {
    let temp = tempdir().unwrap();
    let current_running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let orchestrator = Orchestrator::builder(config(&temp))
        .register_tool(Arc::new(FnTool::new("echo", {
            let current_running = current_running.clone();
            let max_running = max_running.clone();
            move |_| {
                let current_running = current_running.clone();
                let max_running = max_running.clone();
                async move {
                    let running_now = current_running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(running_now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    current_running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(ToolOutput::success())
                }
            }
        })))
        .build()
        .unwrap();

    let summary = orchestrator
        .run_multi_agent_task(request(&[("a", "one"), ("b", "two"), ("c", "three")]))
        .await
        .unwrap();

    assert_eq!(summary.overall_status, RunStatus::Success);
    assert!(
        max_running.load(Ordering::SeqCst) > 1,
        "expected overlapping sub-runs, saw max {}",
        max_running.load(Ordering::SeqCst)
    );
    assert_eq!(current_running.load(Ordering::SeqCst), 0);

    let mut dirs = summary
        .agent_runs
        .iter()
        .map(|a| a.run.checkpoint_dir.clone())
        .collect::<Vec<_>>();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 3);
}

#[tokio::test]
async fn empty_agent_list_is_an_error() {
    let temp = tempdir().unwrap();
    let orchestrator = Orchestrator::builder(config(&temp)).build().unwrap();
    let err = orchestrator
        .run_multi_agent_task(request(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
}

#[tokio::test]
async fn cancellation_reaches_every_sub_run() {
    let temp = tempdir().unwrap();
    let orchestrator = Orchestrator::builder(config(&temp))
        .register_tool(Arc::new(FnTool::new("echo", |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, anyhow::Error>(ToolOutput::exit(1))
        })))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = orchestrator
        .run_multi_agent_task_with_cancel(request(&[("a", "one"), ("b", "two")]), cancel)
        .await
        .unwrap();

    assert_eq!(summary.overall_status, RunStatus::Cancelled);
    assert_eq!(summary.agent_runs.len(), 2);
    assert!(summary
        .agent_runs
        .iter()
        .all(|a| a.run.status == RunStatus::Cancelled));

    let coordinator = orchestrator
        .resume_run(&summary.coordinator_run_id)
        .unwrap();
    assert_eq!(coordinator.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn sub_runs_are_listed_resumed_and_rolled_back_by_id() {
    let temp = tempdir().unwrap();
    let orchestrator = Orchestrator::builder(config(&temp)).build().unwrap();

    let summary = orchestrator
        .run_multi_agent_task(request(&[("docs", "docs")]))
        .await
        .unwrap();
    let sub_run_id = summary.agent_runs[0].run.run_id.clone();

    let listed = orchestrator.list_runs().unwrap();
    assert_eq!(listed.len(), 2);
    let entry = listed.iter().find(|r| r.run_id == sub_run_id).unwrap();
    assert_eq!(
        entry.parent_run_id.as_deref(),
        Some(summary.coordinator_run_id.as_str())
    );

    let resumed = orchestrator.resume_run(&sub_run_id).unwrap();
    assert_eq!(resumed.status, RunStatus::Success);
    assert_eq!(resumed.checkpoint_dir, summary.agent_runs[0].run.checkpoint_dir);
    assert_eq!(resumed.steps, summary.agent_runs[0].run.steps);

    let ack = orchestrator.rollback_run(&sub_run_id, "docs were wrong").unwrap();
    assert!(ack.ok);
    assert!(resumed.checkpoint_dir.join(ROLLBACK_FILE).is_file());
    assert!(!summary.checkpoint_dir.join(ROLLBACK_FILE).exists());
}
