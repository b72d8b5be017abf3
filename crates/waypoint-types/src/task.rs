use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

const DEFAULT_TASK_TYPE: &str = "generic";

/// A declared high-risk action, either a bare target string or a structured entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HighRiskAction {
    Target(String),
    Declared(DeclaredAction),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredAction {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub approved: bool,
}

impl HighRiskAction {
    pub fn declared(category: &str, target: &str, approved: bool) -> Self {
        HighRiskAction::Declared(DeclaredAction {
            category: Some(category.to_string()),
            target: Some(target.to_string()),
            reason: None,
            approved,
        })
    }
}

/// Task-type specific requirements, tagged by `task_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskRequirements {
    Generic {
        #[serde(default, alias = "highRiskActions")]
        high_risk_actions: Vec<HighRiskAction>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    CodeChange {
        #[serde(default, alias = "highRiskActions")]
        high_risk_actions: Vec<HighRiskAction>,
        #[serde(default)]
        files: Vec<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    SubAgent {
        agent_id: String,
        focus: String,
        sequence: u32,
        coordinator_run_id: String,
        #[serde(default, alias = "highRiskActions")]
        high_risk_actions: Vec<HighRiskAction>,
    },
}

impl Default for TaskRequirements {
    fn default() -> Self {
        TaskRequirements::Generic {
            high_risk_actions: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl TaskRequirements {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskRequirements::Generic { .. } => DEFAULT_TASK_TYPE,
            TaskRequirements::CodeChange { .. } => "code_change",
            TaskRequirements::SubAgent { .. } => "sub_agent",
        }
    }

    pub fn high_risk_actions(&self) -> &[HighRiskAction] {
        match self {
            TaskRequirements::Generic {
                high_risk_actions, ..
            }
            | TaskRequirements::CodeChange {
                high_risk_actions, ..
            }
            | TaskRequirements::SubAgent {
                high_risk_actions, ..
            } => high_risk_actions,
        }
    }

    pub fn with_high_risk_actions(actions: Vec<HighRiskAction>) -> Self {
        TaskRequirements::Generic {
            high_risk_actions: actions,
            metadata: Map::new(),
        }
    }
}

fn requirements_with_default_tag<'de, D>(deserializer: D) -> Result<TaskRequirements, D::Error>
where
    D: Deserializer<'de>,
{
    let mut value = Value::deserialize(deserializer)?;
    match &mut value {
        Value::Null => return Ok(TaskRequirements::default()),
        Value::Object(map) => {
            map.entry("task_type")
                .or_insert_with(|| Value::String(DEFAULT_TASK_TYPE.to_string()));
        }
        _ => {}
    }
    TaskRequirements::deserialize(value).map_err(serde::de::Error::custom)
}

/// A request to execute a single goal as one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// A requirements object without `task_type` is read as `generic`.
    #[serde(default, deserialize_with = "requirements_with_default_tag")]
    pub requirements: TaskRequirements,
    /// Overrides the tool configured for the task type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_snapshot: Option<String>,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            acceptance_criteria: Vec::new(),
            requirements: TaskRequirements::default(),
            tool: None,
            repo_snapshot: None,
        }
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn task_type(&self) -> &'static str {
        self.requirements.task_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub focus: String,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, focus: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            focus: focus.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentRequest {
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub agents: Vec<AgentProfile>,
    /// Declared for every sub-run; approvals are evaluated per sub-run.
    #[serde(default)]
    pub high_risk_actions: Vec<HighRiskAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}
