use chrono::Utc;
use sha2::{Digest, Sha256};

use waypoint_types::{ApprovalPrompt, PolicyContext, StepPlan, TaskRequest};

use crate::approval;

/// A planned step together with the approval prompts it declares.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub plan: StepPlan,
    pub prompts: Vec<ApprovalPrompt>,
}

/// Stable hash of the goal, so identical goals get identical seeds.
pub fn deterministic_seed(goal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn step_id(sequence: u32) -> String {
    format!("step-{}", sequence)
}

pub fn intended_command(tool: &str, goal: &str) -> String {
    format!("{} {}", tool, goal)
}

/// Builds the step sequence for a run. Requests currently plan as a single step.
pub fn plan_steps(
    run_id: &str,
    request: &TaskRequest,
    tool: &str,
    policy_version: &str,
) -> Vec<PlannedStep> {
    vec![plan_step(run_id, request, tool, policy_version, 1)]
}

/// Plans the step at `sequence` (1-based) of a run.
pub fn plan_step(
    run_id: &str,
    request: &TaskRequest,
    tool: &str,
    policy_version: &str,
    sequence: u32,
) -> PlannedStep {
    let step_id = step_id(sequence);
    let prompts = approval::normalize(&step_id, &request.requirements);
    let plan = StepPlan {
        step_id,
        run_id: run_id.to_string(),
        sequence,
        goal: request.goal.clone(),
        acceptance_criteria: request.acceptance_criteria.clone(),
        risks: prompts.iter().map(approval::risk_label).collect(),
        policy_context: PolicyContext {
            policy_version: policy_version.to_string(),
            tool: tool.to_string(),
            intended_command: intended_command(tool, &request.goal),
        },
        seed: deterministic_seed(&request.goal),
        created_at: Utc::now(),
    };
    PlannedStep { plan, prompts }
}
