use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use waypoint_types::CheckStatus;

mod shell;

pub use shell::ShellTool;

/// What a tool reports back for one invocation. `exit_code == 0` is success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Optional lint/typecheck/test/build outcomes, reported but not evaluated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckStatus>,
}

impl ToolOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn with_output_ref(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }

    pub fn with_check(mut self, name: impl Into<String>, status: CheckStatus) -> Self {
        self.checks.insert(name.into(), status);
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A registered handler. Implementations must tolerate concurrent invocation
/// with different argument maps; the orchestrator does not lock around calls.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput>;

    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        self.execute(args).await
    }
}

/// Immutable name -> handler lookup, shared read-only across concurrent runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.tools.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Registers under the tool's own name. A later registration replaces an earlier one.
    pub fn register(self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        self.register_as(name, tool)
    }

    pub fn register_as(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        let name = name.into();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registration replaced an existing handler");
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}

/// Always exits 0.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput> {
        tracing::debug!(args = %args, "echo tool invoked");
        Ok(ToolOutput::success())
    }
}

/// Adapts an async closure into a [`Tool`].
pub struct FnTool<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutput> {
        (self.handler)(args).await
    }
}

/// Reads the 1-based attempt number the orchestrator passes in tool arguments.
pub fn attempt_from_args(args: &Value) -> u32 {
    args.get("attempt")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(1)
}
