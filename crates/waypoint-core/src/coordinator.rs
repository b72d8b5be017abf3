// Multi-Agent Coordinator
// Fans one goal out to concurrent, independently checkpointed sub-runs.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use waypoint_observability::{emit_event, redact_text, ObservabilityEvent};
use waypoint_types::{
    new_run_id, AgentProfile, AgentRunSummary, CoordinationSummary, MultiAgentRequest,
    MultiAgentSummary, RunManifest, RunStatus, RunSummary, TaskRequest, TaskRequirements,
};

use crate::error::{OrchestratorError, Result};
use crate::executor::{StepExecutor, PROCESS};
use crate::finalize;
use crate::store::{CheckpointStore, AGENTS_DIR, COORDINATION_FILE, REQUIREMENTS_FILE};

pub const MULTI_AGENT_TASK_TYPE: &str = "multi_agent";
const COMPONENT: &str = "orchestrator.coordinator";

fn agent_goal(goal: &str, agent: &AgentProfile) -> String {
    format!("{} (agent {}: {})", goal, agent.id, agent.focus)
}

fn agent_request(
    request: &MultiAgentRequest,
    agent: &AgentProfile,
    sequence: u32,
    coordinator_run_id: &str,
) -> TaskRequest {
    TaskRequest {
        goal: agent_goal(&request.goal, agent),
        acceptance_criteria: request.acceptance_criteria.clone(),
        requirements: TaskRequirements::SubAgent {
            agent_id: agent.id.clone(),
            focus: agent.focus.clone(),
            sequence,
            coordinator_run_id: coordinator_run_id.to_string(),
            high_risk_actions: request.high_risk_actions.clone(),
        },
        tool: request.tool.clone(),
        repo_snapshot: None,
    }
}

/// Placeholder for a sub-run that never produced a summary of its own.
fn failed_agent(
    agent: &AgentProfile,
    sequence: u32,
    store: &CheckpointStore,
    error: String,
) -> AgentRunSummary {
    AgentRunSummary {
        agent_id: agent.id.clone(),
        focus: agent.focus.clone(),
        sequence,
        run: RunSummary {
            run_id: String::new(),
            status: RunStatus::Failed,
            checkpoint_dir: store.root().to_path_buf(),
            steps: Vec::new(),
        },
        error: Some(error),
    }
}

/// Starts one sub-run per agent and waits for every one of them.
///
/// A failing sub-run does not stop the others. The coordinator succeeds only
/// when all sub-runs succeed.
pub async fn run_multi_agent(
    executor: &StepExecutor,
    store: &CheckpointStore,
    request: MultiAgentRequest,
    cancel: CancellationToken,
) -> Result<MultiAgentSummary> {
    if request.agents.is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "at least one agent profile is required".to_string(),
        ));
    }
    if request.goal.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "goal must not be empty".to_string(),
        ));
    }

    let coordinator_run_id = new_run_id();
    let config = executor.config();
    let manifest = RunManifest::new(
        coordinator_run_id.clone(),
        MULTI_AGENT_TASK_TYPE,
        config.model.clone(),
        config.policy.version.clone(),
    );
    let run = store.create_run(&manifest)?;
    run.write_record(REQUIREMENTS_FILE, &request)?;
    let agent_store = CheckpointStore::new(run.path().join(AGENTS_DIR))?;

    let redacted_goal = redact_text(&request.goal);
    tracing::info!(
        run_id = %coordinator_run_id,
        agents = request.agents.len(),
        "coordinator started"
    );
    emit_event(
        Level::INFO,
        PROCESS,
        ObservabilityEvent::new("coordinator.started", COMPONENT)
            .run(&coordinator_run_id)
            .status(RunStatus::Running.as_str())
            .detail(&redacted_goal),
    );

    let mut join_set: JoinSet<AgentRunSummary> = JoinSet::new();
    for (index, agent) in request.agents.iter().enumerate() {
        let sequence = index as u32 + 1;
        let sub_request = agent_request(&request, agent, sequence, &coordinator_run_id);
        let executor = executor.clone();
        let agent_store = agent_store.clone();
        let agent = agent.clone();
        let parent = coordinator_run_id.clone();
        let child = cancel.child_token();

        join_set.spawn(async move {
            match executor
                .execute(&agent_store, sub_request, Some(parent), child)
                .await
            {
                Ok(run) => AgentRunSummary {
                    agent_id: agent.id,
                    focus: agent.focus,
                    sequence,
                    run,
                    error: None,
                },
                Err(e) => {
                    tracing::error!(agent_id = %agent.id, "agent run failed to execute: {}", e);
                    failed_agent(&agent, sequence, &agent_store, e.to_string())
                }
            }
        });
    }

    let mut settled: BTreeMap<u32, AgentRunSummary> = BTreeMap::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(summary) => {
                emit_event(
                    if summary.run.status == RunStatus::Success {
                        Level::INFO
                    } else {
                        Level::WARN
                    },
                    PROCESS,
                    ObservabilityEvent::new("coordinator.agent_settled", COMPONENT)
                        .run(&coordinator_run_id)
                        .agent(&summary.agent_id)
                        .status(summary.run.status.as_str()),
                );
                settled.insert(summary.sequence, summary);
            }
            Err(e) => {
                tracing::error!(run_id = %coordinator_run_id, "agent task aborted: {}", e);
            }
        }
    }

    // A panicked sub-run task leaves no summary behind; report it as failed.
    let agent_runs = request
        .agents
        .iter()
        .enumerate()
        .map(|(index, agent)| {
            let sequence = index as u32 + 1;
            settled.remove(&sequence).unwrap_or_else(|| {
                failed_agent(agent, sequence, &agent_store, "agent task aborted".to_string())
            })
        })
        .collect::<Vec<_>>();

    let overall_status = if cancel.is_cancelled() {
        RunStatus::Cancelled
    } else if agent_runs
        .iter()
        .all(|agent| agent.run.status == RunStatus::Success)
    {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };

    let summary = CoordinationSummary {
        coordinator_run_id: coordinator_run_id.clone(),
        overall_status,
        checkpoint_dir: run.path().to_path_buf(),
        agent_runs,
        completed_at: Utc::now(),
    };
    run.write_record(COORDINATION_FILE, &summary)?;
    finalize::finalize_coordination(&run, &summary)?;
    run.finalize_manifest(overall_status, Utc::now())?;

    emit_event(
        if overall_status == RunStatus::Success {
            Level::INFO
        } else {
            Level::WARN
        },
        PROCESS,
        ObservabilityEvent::new("coordinator.joined", COMPONENT)
            .run(&coordinator_run_id)
            .status(overall_status.as_str()),
    );

    Ok(summary)
}
