//! The daemon loop.
//!
//! One task owns every in-memory structure (sources, ledger, lists, block
//! manager), so each cycle runs its steps strictly in order:
//!
//! 1. take the cycle's `now`
//! 2. reload the block table if the store changed externally
//! 3. poll sources, match rules, count failures and trigger blocks
//! 4. sweep expired blocks
//! 5. purge expired ledger entries
//! 6. reload changed list files and reconcile deny enforcement
//! 7. emit the counters summary every [`SUMMARY_EVERY`] cycles

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertDispatcher;
use crate::blocks::{BlockManager, Trigger, TriggerOutcome};
use crate::config::{Config, Settings};
use crate::enforcer::FirewallApplier;
use crate::error::ConfigError;
use crate::ledger::FailureLedger;
use crate::lists::{deny_diff, ListResolver};
use crate::rules::{RuleBook, RuleOutcome};
use crate::signal::{ReloadToken, ShutdownToken};
use crate::sources::SourceRegistry;
use crate::store::StateStore;
use crate::utils::format_count_with_separator;

/// Cycles between two counters summaries.
pub const SUMMARY_EVERY: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub lines: u64,
    pub matched: u64,
    pub skipped: u64,
    pub blocks: u64,
    pub refreshes: u64,
    pub unblocks: u64,
    pub apply_failures: u64,
    pub alert_failures: u64,
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lines={} matched={} skipped={} blocks={} refreshes={} unblocks={} \
             apply_failures={} alert_failures={}",
            format_count_with_separator(self.lines),
            format_count_with_separator(self.matched),
            format_count_with_separator(self.skipped),
            self.blocks,
            self.refreshes,
            self.unblocks,
            self.apply_failures,
            self.alert_failures
        )
    }
}

pub struct Dispatcher {
    config_path: PathBuf,
    config: Arc<Config>,
    rules: RuleBook,
    sources: SourceRegistry,
    ledger: FailureLedger,
    lists: ListResolver,
    blocks: BlockManager,
    /// Deny networks the lists currently ask to enforce
    deny_desired: BTreeSet<IpNet>,
    counters: Counters,
    cycles: u64,
}

impl Dispatcher {
    /// Validate `config` and build the engine. Fails when the configuration is
    /// invalid or none of the sources can be read.
    pub fn new(
        config: Config,
        config_path: impl Into<PathBuf>,
        applier: Arc<dyn FirewallApplier>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = RuleBook::from_config(&config)?;
        let sources = SourceRegistry::from_config(&config.sources, config.read_budget);
        sources.check_readable()?;

        let config = Arc::new(config);
        let settings: Arc<dyn Settings> = config.clone();
        let lists = ListResolver::load(&config.lists);
        let deny_desired = lists.snapshot().enforceable_deny();
        let blocks = BlockManager::new(
            applier,
            alerts,
            settings.clone(),
            StateStore::from_config(&config),
        );

        Ok(Self {
            config_path: config_path.into(),
            config,
            rules,
            sources,
            ledger: FailureLedger::new(settings),
            lists,
            blocks,
            deny_desired,
            counters: Counters::default(),
            cycles: 0,
        })
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockManager {
        &mut self.blocks
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Re-apply stored blocks and enforce the deny list.
    pub async fn startup(&mut self, now: DateTime<Utc>) {
        self.blocks.restore(now).await;
        self.blocks.reconcile_deny(&self.deny_desired).await;
    }

    /// One pass of the loop at time `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) {
        self.cycles += 1;

        self.blocks.refresh_from_store();

        let triggers = self.process_sources(now);
        for trigger in triggers {
            match self.blocks.trigger(trigger, now).await {
                TriggerOutcome::Blocked { alert_failed, .. } => {
                    self.counters.blocks += 1;
                    if alert_failed {
                        self.counters.alert_failures += 1;
                    }
                }
                TriggerOutcome::Refreshed { .. } => self.counters.refreshes += 1,
                TriggerOutcome::ApplyFailed => self.counters.apply_failures += 1,
                TriggerOutcome::AlreadyBlocked(_)
                | TriggerOutcome::WouldBlock
                | TriggerOutcome::StoreFailed => {}
            }
        }

        let report = self.blocks.sweep(now).await;
        self.counters.unblocks += report.unblocked.len() as u64;
        self.counters.apply_failures += report.failed as u64;

        self.ledger.purge_expired(now);

        if let Some(old) = self.lists.reload_if_changed() {
            let current = self.lists.snapshot();
            let (added, removed) = deny_diff(&old, &current);
            let (allow, ignore, deny) = current.counts();
            info!(
                "Lists reloaded: {} allow, {} ignore, {} deny (deny +{} -{})",
                allow,
                ignore,
                deny,
                added.len(),
                removed.len()
            );
            self.deny_desired = current.enforceable_deny();
        }
        if &self.deny_desired != self.blocks.deny_targets() {
            self.blocks.reconcile_deny(&self.deny_desired).await;
        }

        if self.cycles % SUMMARY_EVERY == 0 {
            info!("Counters: {}", self.counters);
        }
    }

    /// Poll every source and turn threshold crossings into triggers, at most
    /// one per (address, classification) per cycle.
    fn process_sources(&mut self, now: DateTime<Utc>) -> Vec<Trigger> {
        let mut pending: Vec<Trigger> = Vec::new();
        let mut index: HashMap<(IpAddr, String), usize> = HashMap::new();
        let lists = self.lists.snapshot();

        for source in self.sources.iter_mut() {
            let batch = match source.poll() {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Skipping {} this cycle: {}", source.path().display(), e);
                    continue;
                }
            };
            self.counters.lines += batch.lines.len() as u64;
            self.counters.skipped += batch.skipped;

            for line in &batch.lines {
                let hit = match self.rules.apply(source.rule_set(), line) {
                    RuleOutcome::Matched(hit) => hit,
                    RuleOutcome::NoMatch => continue,
                    RuleOutcome::Malformed => {
                        self.counters.skipped += 1;
                        continue;
                    }
                };
                self.counters.matched += 1;

                let count = self.ledger.record_with_sample(
                    hit.address,
                    &hit.classification,
                    hit.weight,
                    now,
                    line,
                );
                let threshold = self.config.policy(&hit.classification).threshold;
                if count < u64::from(threshold) {
                    continue;
                }

                let decision = lists.decision(hit.address);
                if !decision.permits_block() {
                    debug!(
                        "{} crossed the {} threshold, list decision {}",
                        hit.address, hit.classification, decision
                    );
                    continue;
                }

                let trigger = Trigger {
                    address: hit.address,
                    classification: hit.classification.clone(),
                    rule: hit.rule,
                    ports: hit.ports,
                    count,
                    samples: self.ledger.samples(hit.address, &hit.classification),
                };
                match index.get(&(hit.address, hit.classification.clone())) {
                    Some(&i) => pending[i] = trigger,
                    None => {
                        index.insert((hit.address, hit.classification), pending.len());
                        pending.push(trigger);
                    }
                }
            }
        }
        pending
    }

    /// Re-read the configuration file. On error the running configuration
    /// stays in effect. Ledger counts and read positions are kept.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let config = Config::load(&self.config_path)?;
        config.validate()?;
        let rules = RuleBook::from_config(&config)?;

        if config.state_dir != self.config.state_dir {
            warn!("state_dir changes take effect on restart");
        }

        let config = Arc::new(config);
        let settings: Arc<dyn Settings> = config.clone();
        self.sources
            .reconfigure(&config.sources, config.read_budget);
        self.ledger.set_settings(settings.clone());
        self.blocks.set_settings(settings);
        self.lists.set_config(&config.lists);
        self.deny_desired = self.lists.snapshot().enforceable_deny();
        self.rules = rules;
        self.config = config;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Run until `shutdown` fires. Returns the final counters.
    pub async fn run(mut self, shutdown: ShutdownToken, reload: ReloadToken) -> Counters {
        self.startup(Utc::now()).await;
        info!(
            "Daemon started: {} sources, poll every {}",
            self.sources.len(),
            self.config.poll_interval
        );

        while !shutdown.is_cancelled() {
            if reload.take() {
                match self.reload() {
                    Ok(()) => info!(
                        "Configuration reloaded from {}",
                        self.config_path.display()
                    ),
                    Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                }
            }

            self.run_cycle(Utc::now()).await;

            let interval = self.config.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {}
                _ = reload.requested() => {}
            }
        }

        info!(
            "Daemon stopped, {} blocks stay on the firewall. Counters: {}",
            self.blocks.table().blocks.len(),
            self.counters
        );
        self.counters
    }
}
