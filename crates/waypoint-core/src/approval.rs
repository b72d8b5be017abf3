use waypoint_types::{ApprovalPrompt, HighRiskAction, TaskRequirements};

const DEFAULT_CATEGORY: &str = "custom";
const DEFAULT_REASON: &str = "Declared high-risk action";

/// Turns declared high-risk actions into approval prompts for a step.
///
/// Bare strings become `custom` prompts. Entries without a non-empty target
/// are dropped.
pub fn normalize(step_id: &str, requirements: &TaskRequirements) -> Vec<ApprovalPrompt> {
    requirements
        .high_risk_actions()
        .iter()
        .filter_map(prompt_parts)
        .enumerate()
        .map(|(index, (category, target, reason, approved))| ApprovalPrompt {
            id: format!("{}-approval-{}", step_id, index + 1),
            category,
            target,
            reason,
            approved,
        })
        .collect()
}

/// Prompts that still need sign-off.
pub fn pending(prompts: &[ApprovalPrompt]) -> Vec<ApprovalPrompt> {
    prompts.iter().filter(|p| !p.approved).cloned().collect()
}

/// `"<category>: <target>"`, used as the declared risk for a prompt.
pub fn risk_label(prompt: &ApprovalPrompt) -> String {
    format!("{}: {}", prompt.category, prompt.target)
}

pub fn pending_reason(prompt: &ApprovalPrompt) -> String {
    format!(
        "approval required for {} `{}`: {}",
        prompt.category, prompt.target, prompt.reason
    )
}

fn prompt_parts(action: &HighRiskAction) -> Option<(String, String, String, bool)> {
    match action {
        HighRiskAction::Target(target) => {
            let target = target.trim();
            if target.is_empty() {
                return None;
            }
            Some((
                DEFAULT_CATEGORY.to_string(),
                target.to_string(),
                DEFAULT_REASON.to_string(),
                false,
            ))
        }
        HighRiskAction::Declared(declared) => {
            let target = declared
                .target
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())?;
            let category = declared
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(DEFAULT_CATEGORY);
            let reason = declared
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REASON);
            Some((
                category.to_string(),
                target.to_string(),
                reason.to_string(),
                declared.approved,
            ))
        }
    }
}
