use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const EVENT_TARGET: &str = "waypoint.obs";

/// Which side of the system produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The `waypoint` binary.
    Engine,
    /// Library code running runs and coordinators, whatever hosts it.
    Core,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Core => "core",
        }
    }

    fn log_prefix(self) -> String {
        format!("waypoint.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured lifecycle event. Unset fields are logged as `""`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub step_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub tool: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            ..Self::default()
        }
    }

    pub fn run(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn step(mut self, step_id: &'a str) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn agent(mut self, agent_id: &'a str) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn tool(mut self, tool: &'a str) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Replaces free text (goals, focus strings) with its length and a short hash.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// `tracing::event!` needs a constant level, so each arm expands separately.
macro_rules! observability_event {
    ($level:expr, $process:expr, $event:expr) => {
        tracing::event!(
            target: EVENT_TARGET,
            $level,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            run_id = $event.run_id.unwrap_or(""),
            step_id = $event.step_id.unwrap_or(""),
            agent_id = $event.agent_id.unwrap_or(""),
            tool = $event.tool.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Emits `event` under the `waypoint.obs` target at `level`.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        observability_event!(Level::ERROR, process, event);
    } else if level == Level::WARN {
        observability_event!(Level::WARN, process, event);
    } else if level == Level::INFO {
        observability_event!(Level::INFO, process, event);
    } else if level == Level::DEBUG {
        observability_event!(Level::DEBUG, process, event);
    } else {
        observability_event!(Level::TRACE, process, event);
    }
}

/// Console (stderr) plus daily-rolling JSONL file logging.
///
/// The returned guard must be held for the lifetime of the process or
/// buffered file output is lost. A second call in the same process keeps the
/// first subscriber.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    prune_expired_logs(logs_dir, process, retention_days)?;

    let prefix = process.log_prefix();
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stdout carries command output.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            initialized_at: Utc::now(),
        },
    ))
}

/// Date stamp of a rolled file named `<prefix>.YYYY-MM-DD.jsonl`.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
) -> anyhow::Result<()> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
    let prefix = process.log_prefix();

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_date(name, &prefix))
            .is_some_and(|date| date < cutoff);
        if expired {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}

pub fn logs_dir_under(root: &Path) -> PathBuf {
    root.join("logs")
}
