use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use waypoint_observability::logs_dir_under;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TOOL: &str = "echo";

/// Opaque configuration handed to the policy evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Recorded as `policy_version` in every manifest.
    pub version: String,
    /// External evaluator program; allow-all when unset.
    pub evaluator_command: Option<String>,
    pub settings: Value,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: "default".to_string(),
            evaluator_command: None,
            settings: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub checkpoint_root: PathBuf,
    /// Attempt budget per step. Values below 1 are treated as 1.
    pub max_retries: u32,
    pub default_tool: String,
    /// Task type -> tool name.
    pub task_tools: HashMap<String, String>,
    pub model: String,
    pub policy: PolicyConfig,
    pub logs_dir: PathBuf,
    pub log_retention_days: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let data_root = default_data_root();
        Self {
            checkpoint_root: data_root.join("runs"),
            max_retries: DEFAULT_MAX_RETRIES,
            default_tool: DEFAULT_TOOL.to_string(),
            task_tools: HashMap::new(),
            model: "unspecified".to_string(),
            policy: PolicyConfig::default(),
            logs_dir: logs_dir_under(&data_root),
            log_retention_days: 14,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_checkpoint_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.checkpoint_root = root.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_tool(mut self, tool: impl Into<String>) -> Self {
        self.default_tool = tool.into();
        self
    }

    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Request override, then the task-type binding, then the default tool.
    pub fn resolve_tool(&self, task_type: &str, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .or_else(|| self.task_tools.get(task_type).cloned())
            .unwrap_or_else(|| self.default_tool.clone())
    }

    /// Defaults <- JSON file <- environment <- CLI overrides.
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Self::from_layers(&[file, env_layer(), cli_overrides.unwrap_or_else(empty_object)])
    }

    pub fn from_layers(layers: &[Value]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for layer in layers {
            deep_merge(&mut merged, layer);
        }
        serde_json::from_value(merged)
            .map_err(|e| OrchestratorError::InvalidConfig(format!("Failed to apply config: {}", e)))
    }
}

pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("waypoint")
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::IoError(format!("Failed to read config file: {}", e)))?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring malformed config file: {}", e);
            Ok(empty_object())
        }
    }
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = non_empty("WAYPOINT_CHECKPOINT_ROOT") {
        deep_merge(&mut root, &json!({ "checkpoint_root": path }));
    }
    if let Some(raw) = non_empty("WAYPOINT_MAX_RETRIES") {
        match raw.trim().parse::<u32>() {
            Ok(n) => deep_merge(&mut root, &json!({ "max_retries": n })),
            Err(_) => tracing::warn!("ignoring non-numeric WAYPOINT_MAX_RETRIES={}", raw),
        }
    }
    if let Some(tool) = non_empty("WAYPOINT_DEFAULT_TOOL") {
        deep_merge(&mut root, &json!({ "default_tool": tool }));
    }
    if let Some(model) = non_empty("WAYPOINT_MODEL") {
        deep_merge(&mut root, &json!({ "model": model }));
    }
    if let Some(version) = non_empty("WAYPOINT_POLICY_VERSION") {
        deep_merge(&mut root, &json!({ "policy": { "version": version } }));
    }
    if let Some(command) = non_empty("WAYPOINT_POLICY_EVALUATOR") {
        deep_merge(&mut root, &json!({ "policy": { "evaluator_command": command } }));
    }
    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
