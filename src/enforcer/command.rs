//! Template-driven firewall applier.
//!
//! Each operation renders a configured command template and runs it through a
//! [`CommandExecutor`] on the blocking pool. The executor kills a command that
//! outlives `firewall.timeout`, so a wedged packet filter never leaves
//! processes behind.

use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{FirewallApplier, PortSpec};
use crate::cmd_abstraction::{
    render_template, CommandExecutor, CommandOutput, CommandTimedOut, RealCommandExecutor,
};
use crate::config::FirewallConfig;
use crate::error::ApplyError;

/// Slack on top of the executor's own deadline before the await is abandoned.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Runs `firewall.block_command` / `firewall.unblock_command` (and their
/// IPv6 variants) with `{addr}`, `{ports}` and `{ttl}` substituted.
///
/// `{ports}` renders in multiport form (`22,80,1000:2000`) and is empty when
/// all ports are blocked; `{ttl}` renders as seconds and is empty for
/// permanent blocks. When `firewall.check_command` is set it runs first:
/// a block whose rule is present, or an unblock whose rule is absent, is a
/// no-op.
pub struct CommandApplier {
    executor: Arc<dyn CommandExecutor>,
    config: FirewallConfig,
    timeout: Duration,
}

struct Templates<'a> {
    block: &'a str,
    unblock: &'a str,
    check: &'a str,
}

impl CommandApplier {
    pub fn new(config: &FirewallConfig) -> Self {
        let executor = RealCommandExecutor::with_deadline(config.timeout.get());
        Self::with_executor(config, Arc::new(executor))
    }

    pub fn with_executor(config: &FirewallConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            timeout: config.timeout.get(),
            config: config.clone(),
        }
    }

    fn templates(&self, target: &IpNet) -> Templates<'_> {
        match target {
            IpNet::V4(_) => Templates {
                block: &self.config.block_command,
                unblock: &self.config.unblock_command,
                check: &self.config.check_command,
            },
            IpNet::V6(_) => Templates {
                block: &self.config.block_command_v6,
                unblock: &self.config.unblock_command_v6,
                check: &self.config.check_command_v6,
            },
        }
    }

    async fn execute(
        &self,
        template: &str,
        vars: &[(&str, &str)],
    ) -> Result<CommandOutput, ApplyError> {
        let (program, args) =
            render_template(template, vars).map_err(|e| ApplyError::Spawn(e.to_string()))?;
        debug!("Running firewall command: {} {}", program, args.join(" "));

        let executor = Arc::clone(&self.executor);
        let task = tokio::task::spawn_blocking(move || executor.execute(&program, &args));

        match tokio::time::timeout(self.timeout + KILL_GRACE, task).await {
            Err(_) => Err(ApplyError::Timeout(self.timeout)),
            Ok(Err(join)) => Err(ApplyError::Spawn(join.to_string())),
            Ok(Ok(Err(e))) if e.downcast_ref::<CommandTimedOut>().is_some() => {
                Err(ApplyError::Timeout(self.timeout))
            }
            Ok(Ok(Err(e))) => Err(ApplyError::Spawn(e.to_string())),
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }

    async fn run(&self, template: &str, vars: &[(&str, &str)]) -> Result<(), ApplyError> {
        let output = self.execute(template, vars).await?;
        if output.success {
            Ok(())
        } else {
            Err(ApplyError::Failed(output.failure_summary()))
        }
    }

    /// Whether the rule described by `vars` is already installed. Always
    /// `None` without a check template.
    async fn rule_present(
        &self,
        check: &str,
        vars: &[(&str, &str)],
    ) -> Result<Option<bool>, ApplyError> {
        if check.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.execute(check, vars).await?.success))
    }
}

#[async_trait]
impl FirewallApplier for CommandApplier {
    async fn block(
        &self,
        target: IpNet,
        ports: Option<PortSpec>,
        duration: Option<Duration>,
    ) -> Result<(), ApplyError> {
        let templates = self.templates(&target);
        let addr = target.to_string();
        let ports = ports.map(|p| p.to_multiport()).unwrap_or_default();
        let ttl = duration
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default();
        let vars = [
            ("addr", addr.as_str()),
            ("ports", ports.as_str()),
            ("ttl", ttl.as_str()),
        ];

        if self.rule_present(templates.check, &vars).await? == Some(true) {
            debug!("Rule for {} already present", target);
            return Ok(());
        }
        self.run(templates.block, &vars).await
    }

    async fn unblock(&self, target: IpNet, ports: Option<PortSpec>) -> Result<(), ApplyError> {
        let templates = self.templates(&target);
        let addr = target.to_string();
        let ports = ports.map(|p| p.to_multiport()).unwrap_or_default();
        let vars = [("addr", addr.as_str()), ("ports", ports.as_str()), ("ttl", "")];

        if self.rule_present(templates.check, &vars).await? == Some(false) {
            debug!("No rule for {} to remove", target);
            return Ok(());
        }
        self.run(templates.unblock, &vars).await
    }
}
