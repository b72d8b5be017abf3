//! Checkpointed task orchestration.
//!
//! A run executes a goal as a sequence of steps. Every step passes an
//! approval gate and a policy gate before its tool is invoked, retries tool
//! failures under a bounded attempt budget, and leaves a write-once record
//! trail on disk that can be listed, resumed, rolled back and compared.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use waypoint_tools::{EchoTool, Tool, ToolRegistry, ToolRegistryBuilder};
use waypoint_types::{
    DeterminismReport, MultiAgentRequest, MultiAgentSummary, RollbackAck, RunCheckpoint,
    RunSummary, TaskRequest,
};

pub mod approval;
pub mod compare;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod finalize;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod store;

pub use compare::compare_runs;
pub use config::{OrchestratorConfig, PolicyConfig};
pub use error::{OrchestratorError, Result};
pub use executor::StepExecutor;
pub use policy::{
    CommandPolicyEvaluator, PolicyDecision, PolicyEvaluator, PolicyVerdict, StaticPolicyEvaluator,
};
pub use store::CheckpointStore;

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: CheckpointStore,
    executor: StepExecutor,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.inner.executor.config()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.inner.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.inner.executor.tools()
    }

    pub async fn run_task(&self, request: TaskRequest) -> Result<RunSummary> {
        self.run_task_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn run_task_with_cancel(
        &self,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.inner
            .executor
            .execute(&self.inner.store, request, None, cancel)
            .await
    }

    pub async fn run_multi_agent_task(
        &self,
        request: MultiAgentRequest,
    ) -> Result<MultiAgentSummary> {
        self.run_multi_agent_task_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn run_multi_agent_task_with_cancel(
        &self,
        request: MultiAgentRequest,
        cancel: CancellationToken,
    ) -> Result<MultiAgentSummary> {
        coordinator::run_multi_agent(&self.inner.executor, &self.inner.store, request, cancel).await
    }

    pub fn list_runs(&self) -> Result<Vec<RunCheckpoint>> {
        registry::list_runs(&self.inner.store)
    }

    pub fn resume_run(&self, run_id: &str) -> Result<RunSummary> {
        registry::resume_run(&self.inner.store, run_id)
    }

    pub fn rollback_run(&self, run_id: &str, reason: &str) -> Result<RollbackAck> {
        registry::rollback_run(&self.inner.store, run_id, reason)
    }

    pub fn compare_runs(&self, run_a: &Path, run_b: &Path) -> Result<DeterminismReport> {
        compare::compare_runs(run_a, run_b)
    }
}

/// Assembles an [`Orchestrator`]. The built-in `echo` tool is registered up
/// front; tools registered later under the same name replace it.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    tools: ToolRegistryBuilder,
    registry: Option<ToolRegistry>,
    policy: Option<Arc<dyn PolicyEvaluator>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            tools: ToolRegistry::builder().register(Arc::new(EchoTool)),
            registry: None,
            policy: None,
        }
    }

    pub fn register_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools = self.tools.register(tool);
        self
    }

    pub fn register_tool_as(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.tools = self.tools.register_as(name, tool);
        self
    }

    /// Uses a prebuilt registry instead of the builder's own tools.
    pub fn tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn policy_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = Some(evaluator);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let store = CheckpointStore::new(&self.config.checkpoint_root)?;
        let policy: Arc<dyn PolicyEvaluator> = match self.policy {
            Some(policy) => policy,
            None => match &self.config.policy.evaluator_command {
                Some(command) => Arc::new(CommandPolicyEvaluator::new(command.clone())),
                None => Arc::new(StaticPolicyEvaluator::allow()),
            },
        };
        let tools = self.registry.unwrap_or_else(|| self.tools.build());

        tracing::debug!(
            root = %store.root().display(),
            tools = ?tools.names(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                store,
                executor: StepExecutor::new(Arc::new(self.config), tools, policy),
            }),
        })
    }
}
