use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::PolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Deny => "deny",
            PolicyDecision::RequireApproval => "require_approval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub decision: PolicyDecision,
    #[serde(default)]
    pub reason: String,
}

impl PolicyVerdict {
    pub fn allow() -> Self {
        Self {
            decision: PolicyDecision::Allow,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision::Deny,
            reason: reason.into(),
        }
    }

    pub fn require_approval(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision::RequireApproval,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == PolicyDecision::Allow
    }
}

/// Opaque policy engine consulted before any tool runs.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, policy: &PolicyConfig, command: &str) -> anyhow::Result<PolicyVerdict>;
}

/// Returns the same verdict for every command.
#[derive(Debug, Clone)]
pub struct StaticPolicyEvaluator {
    verdict: PolicyVerdict,
}

impl StaticPolicyEvaluator {
    pub fn allow() -> Self {
        Self {
            verdict: PolicyVerdict::allow(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::deny(reason),
        }
    }

    pub fn require_approval(reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::require_approval(reason),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicyEvaluator {
    async fn evaluate(
        &self,
        _policy: &PolicyConfig,
        _command: &str,
    ) -> anyhow::Result<PolicyVerdict> {
        Ok(self.verdict.clone())
    }
}

/// Delegates to an external program.
///
/// `{"policy": .., "command": ..}` is written to the program's stdin and a
/// `{"decision": .., "reason": ..}` object is read back from stdout.
#[derive(Debug, Clone)]
pub struct CommandPolicyEvaluator {
    program: String,
}

impl CommandPolicyEvaluator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.args(["/C", self.program.as_str()]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", self.program.as_str()]);
            c
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl PolicyEvaluator for CommandPolicyEvaluator {
    async fn evaluate(
        &self,
        policy: &PolicyConfig,
        command: &str,
    ) -> anyhow::Result<PolicyVerdict> {
        let mut child = self.command().spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin unavailable"))?;
        let payload = serde_json::to_vec(&json!({ "policy": policy, "command": command }))?;
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "policy evaluator exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        let verdict = serde_json::from_slice::<PolicyVerdict>(&output.stdout)?;
        Ok(verdict)
    }
}

/// Runs the evaluator; an evaluator error counts as a denial.
pub async fn evaluate_command(
    evaluator: &dyn PolicyEvaluator,
    policy: &PolicyConfig,
    command: &str,
) -> PolicyVerdict {
    match evaluator.evaluate(policy, command).await {
        Ok(verdict) => verdict,
        Err(err) => {
            tracing::warn!(command, "policy evaluator failed: {}", err);
            PolicyVerdict::deny(format!("policy evaluation failed: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl PolicyEvaluator for Broken {
        async fn evaluate(&self, _: &PolicyConfig, _: &str) -> anyhow::Result<PolicyVerdict> {
            anyhow::bail!("engine offline")
        }
    }

    #[tokio::test]
    async fn static_evaluators_return_their_verdict() {
        let policy = PolicyConfig::default();
        let allow = evaluate_command(&StaticPolicyEvaluator::allow(), &policy, "echo hi").await;
        assert!(allow.is_allowed());

        let deny = evaluate_command(&StaticPolicyEvaluator::deny("no"), &policy, "echo hi").await;
        assert_eq!(deny, PolicyVerdict::deny("no"));

        let ask = evaluate_command(
            &StaticPolicyEvaluator::require_approval("needs review"),
            &policy,
            "echo hi",
        )
        .await;
        assert_eq!(ask.decision, PolicyDecision::RequireApproval);
    }

    #[tokio::test]
    async fn evaluator_errors_deny() {
        let verdict = evaluate_command(&Broken, &PolicyConfig::default(), "echo").await;
        assert_eq!(verdict.decision, PolicyDecision::Deny);
        assert!(verdict.reason.contains("engine offline"));
    }

    #[test]
    fn verdict_parses_snake_case_decisions() {
        let verdict: PolicyVerdict =
            serde_json::from_str(r#"{"decision":"require_approval","reason":"prod"}"#).unwrap();
        assert_eq!(verdict, PolicyVerdict::require_approval("prod"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_evaluator_reads_stdout_verdict() {
        let evaluator = CommandPolicyEvaluator::new(
            r#"cat >/dev/null; echo '{"decision":"deny","reason":"blocked by rule 7"}'"#,
        );
        let verdict = evaluator
            .evaluate(&PolicyConfig::default(), "shell rm -rf /")
            .await
            .unwrap();
        assert_eq!(verdict, PolicyVerdict::deny("blocked by rule 7"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_evaluator_sees_the_command() {
        let evaluator = CommandPolicyEvaluator::new(
            concat!(
                r#"if grep -q deploy; then "#,
                r#"echo '{"decision":"require_approval","reason":"deploy"}'; "#,
                r#"else echo '{"decision":"allow"}'; fi"#,
            ),
        );
        let policy = PolicyConfig::default();
        let deploy = evaluator.evaluate(&policy, "shell deploy prod").await.unwrap();
        assert_eq!(deploy.decision, PolicyDecision::RequireApproval);
        let build = evaluator.evaluate(&policy, "shell build").await.unwrap();
        assert!(build.is_allowed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_evaluator_failure_is_an_error() {
        let evaluator = CommandPolicyEvaluator::new("cat >/dev/null; exit 2");
        assert!(evaluator
            .evaluate(&PolicyConfig::default(), "x")
            .await
            .is_err());
    }
}
