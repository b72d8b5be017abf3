use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use waypoint_core::{Orchestrator, OrchestratorConfig};
use waypoint_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use waypoint_tools::ShellTool;
use waypoint_types::{
    AgentProfile, HighRiskAction, MultiAgentRequest, TaskRequest, TaskRequirements,
};

const SHELL_TOOL: &str = "shell";

#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "Checkpointed task orchestration")]
struct Cli {
    /// JSON config file layered over the built-in defaults.
    #[arg(long, global = true, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    checkpoint_root: Option<PathBuf>,
    #[arg(long, global = true)]
    max_retries: Option<u32>,
    #[arg(long, global = true)]
    model: Option<String>,
    /// Registers a `shell` tool that runs this command once per attempt.
    #[arg(long, global = true)]
    exec: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one goal as a run.
    Run {
        goal: Option<String>,
        #[arg(long = "criteria")]
        acceptance_criteria: Vec<String>,
        #[arg(long)]
        tool: Option<String>,
        /// Declares a high-risk target that still needs approval.
        #[arg(long = "high-risk")]
        high_risk: Vec<String>,
        /// Declares a high-risk target as already approved.
        #[arg(long)]
        approved: Vec<String>,
        #[arg(long)]
        repo_snapshot: Option<String>,
        /// Full request as JSON: inline, `@path`, or `-` for stdin.
        #[arg(long, conflicts_with = "goal")]
        request: Option<String>,
    },
    /// Fan one goal out to several agents.
    Multi {
        goal: String,
        /// `id:focus`, repeatable.
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
        #[arg(long = "criteria")]
        acceptance_criteria: Vec<String>,
        #[arg(long)]
        tool: Option<String>,
    },
    /// List runs under the checkpoint root, newest first.
    List,
    Resume {
        run_id: String,
    },
    /// Record a rollback intent for a run.
    Rollback {
        run_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Compare two runs by id or directory.
    Compare {
        run_a: String,
        run_b: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = build_cli_overrides(&cli);
    let config = OrchestratorConfig::load(cli.config.as_deref(), overrides)
        .await
        .context("failed to load configuration")?;

    let (_log_guard, log_info) = init_process_logging(
        ProcessKind::Engine,
        &config.logs_dir,
        config.log_retention_days,
    )?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent::new("logging.initialized", "engine.main")
            .status("ok")
            .detail("engine jsonl logging initialized"),
    );
    info!("engine logging initialized: {:?}", log_info);

    let mut builder = Orchestrator::builder(config);
    if let Some(command) = &cli.exec {
        let shell = ShellTool::new(SHELL_TOOL, command.clone());
        builder = builder.register_tool_as(SHELL_TOOL, Arc::new(shell));
    }
    let orchestrator = builder.build().context("failed to open checkpoint root")?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let default_tool = cli.exec.as_ref().map(|_| SHELL_TOOL.to_string());

    match cli.command {
        Command::Run {
            goal,
            acceptance_criteria,
            tool,
            high_risk,
            approved,
            repo_snapshot,
            request,
        } => {
            let mut request = match request {
                Some(raw) => serde_json::from_value::<TaskRequest>(read_request_json(&raw)?)
                    .context("invalid task request")?,
                None => {
                    let goal = goal.context("a goal or --request is required")?;
                    let actions = high_risk
                        .into_iter()
                        .map(HighRiskAction::Target)
                        .chain(
                            approved
                                .iter()
                                .map(|target| HighRiskAction::declared("custom", target, true)),
                        )
                        .collect::<Vec<_>>();
                    let mut request = TaskRequest::new(goal)
                        .with_acceptance_criteria(acceptance_criteria)
                        .with_requirements(TaskRequirements::with_high_risk_actions(actions));
                    request.repo_snapshot = repo_snapshot;
                    request
                }
            };
            if let Some(tool) = tool.or(default_tool) {
                if request.tool.is_none() {
                    request.tool = Some(tool);
                }
            }
            let summary = orchestrator.run_task_with_cancel(request, cancel).await?;
            print_json(&summary)?;
        }
        Command::Multi {
            goal,
            agents,
            acceptance_criteria,
            tool,
        } => {
            let agents = agents
                .iter()
                .map(|raw| parse_agent(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let request = MultiAgentRequest {
                goal,
                acceptance_criteria,
                agents,
                high_risk_actions: Vec::new(),
                tool: tool.or(default_tool),
            };
            let summary = orchestrator
                .run_multi_agent_task_with_cancel(request, cancel)
                .await?;
            print_json(&summary)?;
        }
        Command::List => {
            print_json(&orchestrator.list_runs()?)?;
        }
        Command::Resume { run_id } => {
            print_json(&orchestrator.resume_run(&run_id)?)?;
        }
        Command::Rollback { run_id, reason } => {
            print_json(&orchestrator.rollback_run(&run_id, &reason)?)?;
        }
        Command::Compare { run_a, run_b } => {
            let a = resolve_run_path(orchestrator.store().root(), &run_a);
            let b = resolve_run_path(orchestrator.store().root(), &run_b);
            print_json(&orchestrator.compare_runs(&a, &b)?)?;
        }
    }

    Ok(())
}

fn build_cli_overrides(cli: &Cli) -> Option<Value> {
    let mut root = Map::new();
    if let Some(path) = &cli.checkpoint_root {
        root.insert("checkpoint_root".to_string(), json!(path));
    }
    if let Some(n) = cli.max_retries {
        root.insert("max_retries".to_string(), json!(n));
    }
    if let Some(model) = &cli.model {
        root.insert("model".to_string(), json!(model));
    }
    if root.is_empty() {
        return None;
    }
    Some(Value::Object(root))
}

fn parse_agent(raw: &str) -> anyhow::Result<AgentProfile> {
    let (id, focus) = raw
        .split_once(':')
        .map(|(id, focus)| (id.trim(), focus.trim()))
        .unwrap_or((raw.trim(), ""));
    if id.is_empty() {
        anyhow::bail!("agent `{}` needs an id (expected id:focus)", raw);
    }
    let focus = if focus.is_empty() { id } else { focus };
    Ok(AgentProfile::new(id, focus))
}

/// A value naming an existing directory is used as is; anything else is a run id.
fn resolve_run_path(root: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_dir() {
        return path;
    }
    root.join(value)
}

fn read_request_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            emit_event(
                tracing::Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.cancel_requested", "engine.main")
                    .status("cancelling"),
            );
            cancel.cancel();
        }
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
