//! Block manager: the life of a block from threshold crossing to expiry.
//!
//! Per address: `Unblocked -> Pending -> Blocked(temporary | permanent) -> Unblocked`.
//! A pending block is applied on the firewall first, written to the store
//! second, and only then announced. The manager keeps a cached copy of the
//! store for cheap lookups, but every decision that leads to a firewall call
//! is taken on a fresh read under the state lock, and the lock is held until
//! the result is stored. The daemon and the CLI therefore never both act on
//! the same target.
//!
//! Firewall rules outlive the daemon. Stopping it leaves every rule in place;
//! [`BlockManager::restore`] re-applies the store at startup through an
//! idempotent applier and removes rules of entries that expired meanwhile.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertDispatcher, Summary};
use crate::config::{Policy, Settings};
use crate::dnsbl::{self, DnsblChecker};
use crate::enforcer::{FirewallApplier, PortSpec};
use crate::error::{ApplyError, BlockError, StoreError};
use crate::lock::LockGuard;
use crate::store::{BlockEntry, Fingerprint, Origin, PersistedState, StateStore};
use crate::utils::{expiry_after, RateLimitedLog};
use crate::validation::format_interval;

/// Upper bound on a DNSBL lookup.
pub const DNSBL_TIMEOUT: Duration = Duration::from_secs(5);

/// Outer bound on alert delivery, above the HTTP client's own timeout.
const ALERT_TIMEOUT: Duration = Duration::from_secs(45);

/// At most one state-integrity error line per interval.
const STORE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// A threshold crossing handed over by the dispatcher.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub address: IpAddr,
    pub classification: String,
    /// Rule that produced the final match
    pub rule: String,
    /// Rule port hint; overrides the classification's
    pub ports: Option<PortSpec>,
    pub count: u64,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new firewall block was applied and stored.
    Blocked {
        target: IpNet,
        expires_at: Option<DateTime<Utc>>,
        escalated: bool,
        alert_failed: bool,
    },
    /// An existing temporary block had its expiry pushed out.
    Refreshed {
        target: IpNet,
        expires_at: Option<DateTime<Utc>>,
    },
    /// A permanent entry, a covering CIDR or a deny entry already blocks it.
    AlreadyBlocked(IpNet),
    /// Blocking is globally disabled.
    WouldBlock,
    /// Firewall call failed or timed out; the address stays unblocked.
    ApplyFailed,
    /// The store could not be read or updated; any applied rule was rolled back.
    StoreFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub unblocked: Vec<IpNet>,
    pub failed: usize,
    pub store_failed: bool,
}

pub struct BlockManager {
    applier: Arc<dyn FirewallApplier>,
    alerts: Arc<dyn AlertDispatcher>,
    dnsbl: Option<Arc<dyn DnsblChecker>>,
    settings: Arc<dyn Settings>,
    store: StateStore,
    table: PersistedState,
    seen: Option<Fingerprint>,
    /// Deny networks with a firewall rule owned by the deny list
    deny: BTreeSet<IpNet>,
    /// Stored targets known to have no firewall rule
    unapplied: HashSet<IpNet>,
    store_log: RateLimitedLog,
}

impl BlockManager {
    pub fn new(
        applier: Arc<dyn FirewallApplier>,
        alerts: Arc<dyn AlertDispatcher>,
        settings: Arc<dyn Settings>,
        store: StateStore,
    ) -> Self {
        Self {
            applier,
            alerts,
            dnsbl: None,
            settings,
            store,
            table: PersistedState::default(),
            seen: None,
            deny: BTreeSet::new(),
            unapplied: HashSet::new(),
            store_log: RateLimitedLog::new(STORE_ERROR_LOG_INTERVAL),
        }
    }

    /// Annotate block alerts with a DNS blocklist verdict.
    pub fn with_dnsbl(mut self, checker: Arc<dyn DnsblChecker>) -> Self {
        self.dnsbl = Some(checker);
        self
    }

    pub fn set_settings(&mut self, settings: Arc<dyn Settings>) {
        self.settings = settings;
    }

    /// Cached view of the store as of the last read or write.
    pub fn table(&self) -> &PersistedState {
        &self.table
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn deny_targets(&self) -> &BTreeSet<IpNet> {
        &self.deny
    }

    /// Record deny networks whose rules the daemon installed, so
    /// administrative changes do not touch them.
    pub fn assume_deny_enforced(&mut self, targets: impl IntoIterator<Item = IpNet>) {
        self.deny.extend(targets);
    }

    fn report_store_error(&mut self, err: &StoreError) {
        if let Some(suppressed) = self.store_log.check() {
            if suppressed > 0 {
                error!(
                    "State store error: {} ({} similar errors suppressed)",
                    err, suppressed
                );
            } else {
                error!("State store error: {}", err);
            }
        }
    }

    /// Take over state we just read or wrote. The fingerprint is cleared so
    /// the next refresh re-reads once and catches writes that raced with ours.
    fn adopt(&mut self, state: PersistedState) {
        self.table = state;
        self.seen = None;
    }

    /// Lock the store and read it. Decisions made on the returned state stay
    /// valid until the guard is dropped.
    async fn lock_and_load(&self) -> Result<(LockGuard, PersistedState), StoreError> {
        let guard = self.store.lock().await?;
        let state = self.store.load()?;
        Ok((guard, state))
    }

    /// Reload the cached table when the state file changed on disk.
    pub fn refresh_from_store(&mut self) -> bool {
        let current = self.store.fingerprint();
        if current == self.seen {
            return false;
        }
        match self.store.load() {
            Ok(state) => {
                let changed = state != self.table;
                if changed {
                    debug!("Block table reloaded ({} entries)", state.blocks.len());
                }
                self.table = state;
                self.seen = current;
                changed
            }
            Err(e) => {
                self.report_store_error(&e);
                false
            }
        }
    }

    async fn apply_block(
        &self,
        target: IpNet,
        ports: Option<PortSpec>,
        duration: Option<Duration>,
    ) -> Result<(), ApplyError> {
        let timeout = self.settings.applier_timeout();
        tokio::time::timeout(timeout, self.applier.block(target, ports, duration))
            .await
            .map_err(|_| ApplyError::Timeout(timeout))?
    }

    async fn apply_unblock(&self, target: IpNet, ports: Option<PortSpec>) -> Result<(), ApplyError> {
        let timeout = self.settings.applier_timeout();
        tokio::time::timeout(timeout, self.applier.unblock(target, ports))
            .await
            .map_err(|_| ApplyError::Timeout(timeout))?
    }

    /// Whether removing the stored entry for `target` needs a firewall call.
    fn has_own_rule(&self, target: &IpNet) -> bool {
        !self.deny.contains(target) && !self.unapplied.contains(target)
    }

    /// Handle a threshold crossing for an unlisted address.
    pub async fn trigger(&mut self, trigger: Trigger, now: DateTime<Utc>) -> TriggerOutcome {
        let target = IpNet::from(trigger.address);
        let policy = self.settings.policy(&trigger.classification);

        if !self.settings.blocking_enabled() {
            info!(
                "Would block {} ({} {} failures), blocking disabled",
                trigger.address, trigger.count, trigger.classification
            );
            return TriggerOutcome::WouldBlock;
        }

        if let Some(net) = self.deny.iter().find(|n| n.contains(&trigger.address)) {
            return TriggerOutcome::AlreadyBlocked(*net);
        }

        let (guard, state) = match self.lock_and_load().await {
            Ok(locked) => locked,
            Err(e) => {
                self.report_store_error(&e);
                return TriggerOutcome::StoreFailed;
            }
        };

        if state.find(&target).is_some() {
            return self.refresh(guard, state, target, &policy, now);
        }
        if let Some(entry) = state.covering(trigger.address) {
            let covering = entry.target;
            self.adopt(state);
            return TriggerOutcome::AlreadyBlocked(covering);
        }

        self.block_new(guard, state, trigger, target, policy, now).await
    }

    /// Extend the daemon's stored entry for `target`. Only the expiry moves,
    /// and only later. Permanent and operator entries are left as they are.
    fn refresh(
        &mut self,
        guard: LockGuard,
        mut state: PersistedState,
        target: IpNet,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> TriggerOutcome {
        let new_expiry = policy.duration.as_duration().map(|d| expiry_after(now, d));
        let old = match state.find(&target) {
            Some(BlockEntry {
                expires_at: Some(old),
                origin: Origin::Daemon,
                ..
            }) => *old,
            _ => {
                self.adopt(state);
                return TriggerOutcome::AlreadyBlocked(target);
            }
        };
        let expires_at = match new_expiry {
            Some(new) if new <= old => Some(old),
            other => other,
        };

        if expires_at != Some(old) {
            if let Some(entry) = state.find_mut(&target) {
                entry.expires_at = expires_at;
            }
            if let Err(e) = self.store.save(&guard, &mut state) {
                self.report_store_error(&e);
                return TriggerOutcome::StoreFailed;
            }
        }
        drop(guard);
        self.adopt(state);

        debug!(
            "Refreshed block on {} until {}",
            target,
            expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "permanent".to_string())
        );
        TriggerOutcome::Refreshed { target, expires_at }
    }

    async fn block_new(
        &mut self,
        guard: LockGuard,
        mut state: PersistedState,
        trigger: Trigger,
        target: IpNet,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> TriggerOutcome {
        let escalation = self.settings.escalation();
        let mut duration = policy.duration.as_duration();
        let mut escalated = false;
        if let (Some(esc), Some(_)) = (escalation, duration) {
            let recent = state.recent_blocks(trigger.address, now, esc.interval);
            if recent + 1 >= esc.count as usize {
                duration = None;
                escalated = true;
            }
        }
        let ports = trigger.ports.clone().or_else(|| policy.ports.clone());

        let evicted = self.make_room(&mut state).await;

        if let Err(e) = self.apply_block(target, ports.clone(), duration).await {
            warn!("Failed to block {}: {}", target, e);
            if !evicted.is_empty() {
                self.save_evictions(&guard, state, &evicted);
            }
            return TriggerOutcome::ApplyFailed;
        }

        let mut reason = format!(
            "{} {} in {} ({})",
            trigger.count,
            trigger.classification,
            format_interval(policy.window),
            trigger.rule
        );
        if escalated {
            reason.push_str(" (escalated)");
        }
        let entry = BlockEntry {
            target,
            reason,
            classification: trigger.classification.clone(),
            created_at: now,
            expires_at: duration.map(|d| expiry_after(now, d)),
            ports: ports.clone(),
            origin: Origin::Daemon,
        };

        state.upsert(entry.clone());
        if let Some(esc) = escalation {
            if duration.is_some() {
                state.record_history(trigger.address, now);
            }
            state.prune_history(now, esc.interval);
        }
        if let Err(e) = self.store.save(&guard, &mut state) {
            self.report_store_error(&e);
            if let Err(e) = self.apply_unblock(target, ports).await {
                warn!("Failed to roll back unstored block on {}: {}", target, e);
            }
            self.unapplied.extend(evicted);
            return TriggerOutcome::StoreFailed;
        }
        drop(guard);
        self.adopt(state);
        self.unapplied.remove(&target);

        info!(
            "Blocked {} for {}: {}",
            target,
            duration
                .map(format_interval)
                .unwrap_or_else(|| "ever".to_string()),
            entry.reason
        );

        let alert_failed = if self.settings.alerts_enabled() {
            let summary = Summary {
                target,
                classification: trigger.classification,
                reason: entry.reason.clone(),
                count: trigger.count,
                window: policy.window,
                duration,
                escalated,
                samples: trigger.samples,
                dnsbl: None,
            };
            !self.send_alert(summary, trigger.address).await
        } else {
            false
        };

        TriggerOutcome::Blocked {
            target,
            expires_at: entry.expires_at,
            escalated,
            alert_failed,
        }
    }

    async fn send_alert(&self, mut summary: Summary, address: IpAddr) -> bool {
        if let Some(checker) = &self.dnsbl {
            summary.dnsbl = Some(dnsbl::check_with_timeout(checker, address, DNSBL_TIMEOUT).await);
        }
        match tokio::time::timeout(ALERT_TIMEOUT, self.alerts.notify(&summary)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Alert for {} not delivered: {:#}", summary.target, e);
                false
            }
            Err(_) => {
                warn!(
                    "Alert for {} timed out after {:?}",
                    summary.target, ALERT_TIMEOUT
                );
                false
            }
        }
    }

    /// Evict the oldest daemon blocks from the locked `state` so one more
    /// fits under the block limit. Returns the evicted targets; the caller
    /// saves `state`.
    async fn make_room(&mut self, state: &mut PersistedState) -> Vec<IpNet> {
        let limit = self.settings.block_limit();
        if limit == 0 {
            return Vec::new();
        }
        let excess = (state.daemon_count() + 1).saturating_sub(limit);

        let mut evicted = Vec::new();
        for entry in state.oldest_daemon_entries().into_iter().take(excess) {
            let target = entry.target;
            if self.has_own_rule(&target) {
                if let Err(e) = self.apply_unblock(target, entry.ports).await {
                    warn!("Failed to evict {} (block limit {}): {}", target, limit, e);
                    continue;
                }
            }
            state.remove(&target);
            self.unapplied.remove(&target);
            info!("Evicted oldest block {} (block limit {})", target, limit);
            evicted.push(target);
        }
        evicted
    }

    /// Store evictions whose rules are already gone even though the block
    /// that needed the room was not applied.
    fn save_evictions(&mut self, guard: &LockGuard, mut state: PersistedState, evicted: &[IpNet]) {
        match self.store.save(guard, &mut state) {
            Ok(()) => self.adopt(state),
            Err(e) => {
                self.report_store_error(&e);
                self.unapplied.extend(evicted.iter().copied());
            }
        }
    }

    /// Unblock and remove every temporary entry with `expires_at <= now`.
    ///
    /// Each candidate is re-read under the lock first, so an entry that
    /// another process extended or removed meanwhile is left alone.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let candidates: Vec<IpNet> = self
            .table
            .blocks
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.target)
            .collect();

        for target in candidates {
            let (guard, mut state) = match self.lock_and_load().await {
                Ok(locked) => locked,
                Err(e) => {
                    self.report_store_error(&e);
                    report.store_failed = true;
                    break;
                }
            };
            let entry = match state.find(&target).cloned() {
                Some(e) if e.is_expired(now) => e,
                Some(_) => {
                    debug!("Block on {} was extended meanwhile", target);
                    self.adopt(state);
                    continue;
                }
                None => {
                    self.unapplied.remove(&target);
                    self.adopt(state);
                    continue;
                }
            };

            if self.has_own_rule(&target) {
                if let Err(e) = self.apply_unblock(target, entry.ports).await {
                    warn!("Failed to unblock expired {}: {}", target, e);
                    report.failed += 1;
                    continue;
                }
            }

            state.remove(&target);
            if let Err(e) = self.store.save(&guard, &mut state) {
                self.report_store_error(&e);
                // The rule is gone; the entry waits for the next sweep
                self.unapplied.insert(target);
                report.store_failed = true;
                continue;
            }
            drop(guard);
            self.adopt(state);
            self.unapplied.remove(&target);
            info!("Unblocked {} (expired)", target);
            report.unblocked.push(target);
        }
        report
    }

    /// Startup: re-apply every live entry and every deny network recorded as
    /// enforced, then remove entries (and rules) that expired while stopped.
    /// Rules that survived the previous run are left as they are by the
    /// applier. Returns the number of stored blocks applied.
    pub async fn restore(&mut self, now: DateTime<Utc>) -> usize {
        let state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                self.report_store_error(&e);
                return 0;
            }
        };
        self.adopt(state);

        let mut applied = 0;
        for entry in self.table.blocks.clone() {
            if entry.is_expired(now) {
                continue;
            }
            let remaining = entry.expires_at.map(|at| remaining_from(at, now));
            match self.apply_block(entry.target, entry.ports, remaining).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Failed to restore block on {}: {}", entry.target, e);
                    self.unapplied.insert(entry.target);
                }
            }
        }
        if applied > 0 {
            info!("Restored {} blocks from {}", applied, self.store.path().display());
        }

        for target in self.table.denied.clone() {
            match self.apply_block(target, None, None).await {
                Ok(()) => {
                    self.deny.insert(target);
                }
                Err(e) => warn!("Failed to restore deny entry {}: {}", target, e),
            }
        }

        let report = self.sweep(now).await;
        if !report.unblocked.is_empty() {
            info!(
                "Removed {} blocks that expired while stopped",
                report.unblocked.len()
            );
        }
        applied
    }

    /// Apply permanent blocks for deny networks not yet enforced.
    pub async fn enforce_deny(&mut self, targets: impl IntoIterator<Item = IpNet>) -> usize {
        let mut applied = 0;
        for target in targets {
            if self.deny.contains(&target) {
                continue;
            }
            // A stored entry already holds a rule for exactly this target
            if self.table.find(&target).is_none() || self.unapplied.contains(&target) {
                if let Err(e) = self.apply_block(target, None, None).await {
                    warn!("Failed to enforce deny entry {}: {}", target, e);
                    continue;
                }
                self.unapplied.remove(&target);
            }
            self.deny.insert(target);
            applied += 1;
        }
        if applied > 0 {
            info!("Enforced {} deny entries", applied);
        }
        applied
    }

    /// Drop deny enforcement for `targets`, keeping rules a stored entry needs.
    pub async fn release_deny(&mut self, targets: impl IntoIterator<Item = IpNet>) -> usize {
        let mut released = 0;
        for target in targets {
            if !self.deny.contains(&target) {
                continue;
            }
            if self.table.find(&target).is_none() {
                if let Err(e) = self.apply_unblock(target, None).await {
                    warn!("Failed to release deny entry {}: {}", target, e);
                    continue;
                }
            }
            self.deny.remove(&target);
            released += 1;
        }
        if released > 0 {
            info!("Released {} deny entries", released);
        }
        released
    }

    /// Bring deny enforcement in line with `desired` and record the enforced
    /// set in the store. Failed targets are retried on the next call.
    pub async fn reconcile_deny(&mut self, desired: &BTreeSet<IpNet>) {
        let stale: Vec<IpNet> = self.deny.difference(desired).copied().collect();
        self.release_deny(stale).await;
        let missing: Vec<IpNet> = desired.difference(&self.deny).copied().collect();
        self.enforce_deny(missing).await;

        if self.table.denied != self.deny {
            let enforced = self.deny.clone();
            match self.store.with_lock(move |state| state.denied = enforced).await {
                Ok((_, state)) => self.adopt(state),
                Err(e) => self.report_store_error(&e),
            }
        }
    }

    /// Administrative block. An existing entry for the same target is replaced
    /// in the store without a second firewall rule; its ports are kept.
    pub async fn block_manual(
        &mut self,
        target: IpNet,
        duration: Option<Duration>,
        ports: Option<PortSpec>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<BlockEntry, BlockError> {
        let (guard, mut state) = self.lock_and_load().await?;
        let existing = state.find(&target).cloned();
        let applied = existing.is_none() && !self.deny.contains(&target);
        if applied {
            self.apply_block(target, ports.clone(), duration).await?;
        }

        let entry = BlockEntry {
            target,
            reason: reason.to_string(),
            classification: "manual".to_string(),
            created_at: now,
            expires_at: duration.map(|d| expiry_after(now, d)),
            ports: existing.map(|e| e.ports).unwrap_or(ports),
            origin: Origin::Manual,
        };
        state.upsert(entry.clone());
        if let Err(e) = self.store.save(&guard, &mut state) {
            if applied {
                if let Err(e) = self.apply_unblock(target, entry.ports.clone()).await {
                    warn!("Failed to roll back unstored block on {}: {}", target, e);
                }
            }
            return Err(e.into());
        }
        drop(guard);
        self.adopt(state);
        Ok(entry)
    }

    /// Administrative removal. `Ok(None)` when nothing is stored for `target`.
    pub async fn unblock_manual(&mut self, target: IpNet) -> Result<Option<BlockEntry>, BlockError> {
        let (guard, mut state) = self.lock_and_load().await?;
        let Some(entry) = state.find(&target).cloned() else {
            return Ok(None);
        };
        if self.has_own_rule(&target) {
            self.apply_unblock(target, entry.ports.clone()).await?;
        }
        state.remove(&target);
        self.store.save(&guard, &mut state)?;
        drop(guard);
        self.adopt(state);
        self.unapplied.remove(&target);
        Ok(Some(entry))
    }

    /// Remove every temporary entry. Returns how many were removed.
    pub async fn flush_temporary(&mut self) -> Result<usize, BlockError> {
        let targets: Vec<IpNet> = self
            .store
            .load()?
            .blocks
            .iter()
            .filter(|e| !e.is_permanent())
            .map(|e| e.target)
            .collect();

        let mut removed = 0;
        for target in targets {
            match self.unblock_manual(target).await {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(BlockError::Apply(e)) => warn!("Failed to unblock {}: {}", target, e),
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// Time left until `at`, never below one second.
fn remaining_from(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now)
        .to_std()
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::fake::RecordingDispatcher;
    use crate::config::{Config, Interval};
    use crate::enforcer::mock::{Call, MockApplier};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        applier: Arc<MockApplier>,
        alerts: Arc<RecordingDispatcher>,
        manager: BlockManager,
    }

    fn harness_with(config: Config) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(
            dir.path().join("state.json"),
            dir.path().join("state.lock"),
            Duration::from_millis(500),
        );
        let applier = Arc::new(MockApplier::new());
        let alerts = Arc::new(RecordingDispatcher::new());
        let manager = BlockManager::new(
            applier.clone(),
            alerts.clone(),
            Arc::new(config),
            store,
        );
        Harness {
            _dir: dir,
            applier,
            alerts,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trigger(addr: &str) -> Trigger {
        Trigger {
            address: addr.parse().unwrap(),
            classification: "auth-failure".to_string(),
            rule: "sshd-failed-password".to_string(),
            ports: None,
            count: 5,
            samples: vec!["Failed password".to_string()],
        }
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_new_block_applied_stored_and_alerted() {
        let mut h = harness();
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(40)).await;

        assert_eq!(
            outcome,
            TriggerOutcome::Blocked {
                target: net("203.0.113.7/32"),
                expires_at: Some(t(40 + 3600)),
                escalated: false,
                alert_failed: false,
            }
        );
        assert_eq!(
            h.applier.calls(),
            vec![Call::Block(
                net("203.0.113.7/32"),
                None,
                Some(Duration::from_secs(3600))
            )]
        );
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert_eq!(stored.blocks[0].origin, Origin::Daemon);
        assert!(stored.blocks[0].reason.contains("auth-failure"));

        let sent = h.alerts.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].samples, vec!["Failed password".to_string()]);
    }

    #[tokio::test]
    async fn test_retrigger_refreshes_without_second_block() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(40)).await;
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(50)).await;

        assert_eq!(
            outcome,
            TriggerOutcome::Refreshed {
                target: net("203.0.113.7/32"),
                expires_at: Some(t(50 + 3600)),
            }
        );
        assert_eq!(h.applier.block_count(), 1);
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert_eq!(stored.blocks[0].expires_at, Some(t(3650)));
        assert_eq!(h.alerts.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_never_shortens_expiry() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(100)).await;
        h.manager.trigger(trigger("203.0.113.7"), t(10)).await;
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks[0].expires_at, Some(t(3700)));
    }

    #[tokio::test]
    async fn test_permanent_block_retrigger_is_noop() {
        let mut h = harness();
        h.manager
            .block_manual(net("203.0.113.7/32"), None, None, "manual", t(0))
            .await
            .unwrap();
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(10)).await;
        assert_eq!(outcome, TriggerOutcome::AlreadyBlocked(net("203.0.113.7/32")));
        assert_eq!(h.applier.block_count(), 1);
    }

    #[tokio::test]
    async fn test_covering_cidr_blocks_trigger() {
        let mut h = harness();
        h.manager
            .block_manual(
                net("198.51.100.0/24"),
                Some(Duration::from_secs(600)),
                None,
                "noisy range",
                t(0),
            )
            .await
            .unwrap();
        let outcome = h.manager.trigger(trigger("198.51.100.9"), t(10)).await;
        assert_eq!(outcome, TriggerOutcome::AlreadyBlocked(net("198.51.100.0/24")));
    }

    #[tokio::test]
    async fn test_apply_failure_leaves_unblocked_and_retries() {
        let mut h = harness();
        *h.applier.fail_block.lock().unwrap() = true;
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert_eq!(outcome, TriggerOutcome::ApplyFailed);
        assert!(h.manager.store().load().unwrap().blocks.is_empty());
        assert!(h.alerts.sent().is_empty());

        *h.applier.fail_block.lock().unwrap() = false;
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(1)).await;
        assert!(matches!(outcome, TriggerOutcome::Blocked { .. }));
        assert_eq!(h.applier.block_count(), 2);
    }

    #[tokio::test]
    async fn test_apply_timeout_is_bounded() {
        let mut config = Config::default();
        config.firewall.timeout = Interval::from_duration(Duration::from_millis(50));
        let mut h = harness_with(config);
        *h.applier.delay.lock().unwrap() = Some(Duration::from_secs(5));

        let started = std::time::Instant::now();
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert_eq!(outcome, TriggerOutcome::ApplyFailed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_blocking_disabled_would_block() {
        let mut config = Config::default();
        config.blocking_enabled = false;
        let mut h = harness_with(config);
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert_eq!(outcome, TriggerOutcome::WouldBlock);
        assert!(h.applier.calls().is_empty());
        assert!(h.manager.store().fingerprint().is_none());
    }

    #[tokio::test]
    async fn test_alert_failure_does_not_undo_block() {
        let mut h = harness();
        *h.alerts.fail.lock().unwrap() = true;
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert!(matches!(
            outcome,
            TriggerOutcome::Blocked {
                alert_failed: true,
                ..
            }
        ));
        assert_eq!(h.manager.store().load().unwrap().blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_alerts_disabled_sends_nothing() {
        let mut config = Config::default();
        config.alerts_enabled = false;
        let mut h = harness_with(config);
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert!(h.alerts.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_unblocks_expired_once() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        h.manager.trigger(trigger("203.0.113.8"), t(1000)).await;

        // Not expired in the cycle that created it
        let report = h.manager.sweep(t(0)).await;
        assert!(report.unblocked.is_empty());

        let report = h.manager.sweep(t(3600)).await;
        assert_eq!(report.unblocked, vec![net("203.0.113.7/32")]);
        assert_eq!(h.applier.unblock_count(), 1);
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert_eq!(stored.blocks[0].target, net("203.0.113.8/32"));

        let report = h.manager.sweep(t(3601)).await;
        assert!(report.unblocked.is_empty());
        assert_eq!(h.applier.unblock_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_unblock_failure_keeps_entry() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        *h.applier.fail_unblock.lock().unwrap() = true;
        let report = h.manager.sweep(t(4000)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.manager.store().load().unwrap().blocks.len(), 1);

        *h.applier.fail_unblock.lock().unwrap() = false;
        let report = h.manager.sweep(t(4010)).await;
        assert_eq!(report.unblocked.len(), 1);
        assert!(h.manager.store().load().unwrap().blocks.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_entry_extended_meanwhile() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;

        // Another process extends the entry after our cached read
        let store = h.manager.store().clone();
        store
            .with_lock(|s| {
                s.find_mut(&net("203.0.113.7/32")).unwrap().expires_at = Some(t(9000));
            })
            .await
            .unwrap();

        let report = h.manager.sweep(t(3600)).await;
        assert!(report.unblocked.is_empty());
        assert_eq!(h.applier.calls().len(), 1);
        assert_eq!(store.load().unwrap().blocks[0].expires_at, Some(t(9000)));
    }

    #[tokio::test]
    async fn test_escalation_to_permanent() {
        let mut config = Config::default();
        config.escalation.enabled = true;
        config.escalation.count = 3;
        let mut h = harness_with(config);
        let addr = "203.0.113.7";

        for round in 0..2 {
            let start = round * 4000;
            h.manager.trigger(trigger(addr), t(start)).await;
            h.manager.sweep(t(start + 3600)).await;
        }
        let outcome = h.manager.trigger(trigger(addr), t(9000)).await;
        assert!(matches!(
            outcome,
            TriggerOutcome::Blocked {
                escalated: true,
                expires_at: None,
                ..
            }
        ));
        let stored = h.manager.store().load().unwrap();
        assert!(stored.blocks[0].reason.ends_with("(escalated)"));
        assert!(stored.blocks[0].is_permanent());
        assert!(h.alerts.sent().last().unwrap().escalated);
    }

    #[tokio::test]
    async fn test_escalation_ignores_old_history() {
        let mut config = Config::default();
        config.escalation.enabled = true;
        config.escalation.count = 2;
        config.escalation.interval = Interval::from_secs(3600);
        let mut h = harness_with(config);

        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        h.manager.sweep(t(3600)).await;
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(7200)).await;
        assert!(matches!(
            outcome,
            TriggerOutcome::Blocked {
                escalated: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_block_limit_evicts_oldest_daemon_entry() {
        let mut config = Config::default();
        config.block_limit = 2;
        let mut h = harness_with(config);
        h.manager
            .block_manual(net("192.0.2.99/32"), None, None, "manual", t(0))
            .await
            .unwrap();
        h.manager.trigger(trigger("203.0.113.1"), t(1)).await;
        h.manager.trigger(trigger("203.0.113.2"), t(2)).await;
        h.manager.trigger(trigger("203.0.113.3"), t(3)).await;

        let stored = h.manager.store().load().unwrap();
        let targets: Vec<String> = stored.blocks.iter().map(|e| e.target.to_string()).collect();
        assert_eq!(
            targets,
            vec!["192.0.2.99/32", "203.0.113.2/32", "203.0.113.3/32"]
        );
        assert!(h
            .applier
            .calls()
            .contains(&Call::Unblock(net("203.0.113.1/32"))));
    }

    #[tokio::test]
    async fn test_block_limit_eviction_failure_still_blocks() {
        let mut config = Config::default();
        config.block_limit = 1;
        let mut h = harness_with(config);
        h.manager.trigger(trigger("203.0.113.1"), t(1)).await;
        *h.applier.fail_unblock.lock().unwrap() = true;
        let outcome = h.manager.trigger(trigger("203.0.113.2"), t(2)).await;
        assert!(matches!(outcome, TriggerOutcome::Blocked { .. }));
        assert_eq!(h.manager.store().load().unwrap().blocks.len(), 2);
    }

    #[tokio::test]
    async fn test_deny_enforce_and_release() {
        let mut h = harness();
        let desired: BTreeSet<IpNet> = [net("192.0.2.0/24")].into_iter().collect();
        h.manager.reconcile_deny(&desired).await;
        h.manager.reconcile_deny(&desired).await;
        assert_eq!(
            h.applier.calls(),
            vec![Call::Block(net("192.0.2.0/24"), None, None)]
        );

        // Triggers inside a denied network do nothing
        let outcome = h.manager.trigger(trigger("192.0.2.5"), t(0)).await;
        assert_eq!(outcome, TriggerOutcome::AlreadyBlocked(net("192.0.2.0/24")));

        h.manager.reconcile_deny(&BTreeSet::new()).await;
        assert_eq!(h.applier.unblock_count(), 1);
        assert!(h.manager.deny_targets().is_empty());
    }

    #[tokio::test]
    async fn test_deny_release_keeps_stored_rule() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        h.manager.enforce_deny([net("203.0.113.7/32")]).await;
        // Stored entry already has the rule
        assert_eq!(h.applier.block_count(), 1);
        h.manager.release_deny([net("203.0.113.7/32")]).await;
        assert_eq!(h.applier.unblock_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_deny_retried_on_next_reconcile() {
        let mut h = harness();
        let desired: BTreeSet<IpNet> = [net("192.0.2.0/24")].into_iter().collect();
        *h.applier.fail_block.lock().unwrap() = true;
        h.manager.reconcile_deny(&desired).await;
        assert!(h.manager.deny_targets().is_empty());
        *h.applier.fail_block.lock().unwrap() = false;
        h.manager.reconcile_deny(&desired).await;
        assert_eq!(h.manager.deny_targets().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_block_round_trip() {
        let mut h = harness();
        let entry = h
            .manager
            .block_manual(
                net("198.51.100.0/24"),
                Some(Duration::from_secs(600)),
                Some("22".parse().unwrap()),
                "scanner range",
                t(0),
            )
            .await
            .unwrap();
        assert_eq!(entry.origin, Origin::Manual);
        assert_eq!(entry.expires_at, Some(t(600)));

        let removed = h
            .manager
            .unblock_manual(net("198.51.100.0/24"))
            .await
            .unwrap();
        assert_eq!(removed.unwrap().reason, "scanner range");
        assert!(h.manager.store().load().unwrap().blocks.is_empty());
        assert_eq!(h.applier.block_count(), 1);
        assert_eq!(h.applier.unblock_count(), 1);

        assert!(h
            .manager
            .unblock_manual(net("198.51.100.0/24"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_flush_removes_only_temporary() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        h.manager
            .block_manual(net("192.0.2.1/32"), None, None, "keep", t(0))
            .await
            .unwrap();
        let removed = h.manager.flush_temporary().await.unwrap();
        assert_eq!(removed, 1);
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert!(stored.blocks[0].is_permanent());
    }

    #[tokio::test]
    async fn test_refresh_from_store_sees_external_change() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert!(!h.manager.refresh_from_store());

        let store = h.manager.store().clone();
        store
            .with_lock(|s| {
                s.remove(&net("203.0.113.7/32"));
            })
            .await
            .unwrap();
        assert!(h.manager.refresh_from_store());
        assert!(h.manager.table().blocks.is_empty());
        assert!(!h.manager.refresh_from_store());
    }

    #[tokio::test]
    async fn test_unreadable_store_blocks_nothing() {
        let mut h = harness();
        std::fs::write(h.manager.store().path(), "garbage").unwrap();
        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        assert_eq!(outcome, TriggerOutcome::StoreFailed);
        assert!(h.applier.calls().is_empty());
        assert_eq!(
            std::fs::read_to_string(h.manager.store().path()).unwrap(),
            "garbage"
        );
    }

    fn stored_entry(target: &str, expires_at: Option<DateTime<Utc>>) -> BlockEntry {
        BlockEntry {
            target: net(target),
            reason: "earlier run".to_string(),
            classification: "auth-failure".to_string(),
            created_at: t(0),
            expires_at,
            ports: None,
            origin: Origin::Daemon,
        }
    }

    #[tokio::test]
    async fn test_restore_reapplies_live_and_drops_expired() {
        let mut h = harness();
        let store = h.manager.store().clone();
        store
            .with_lock(|s| {
                s.upsert(stored_entry("203.0.113.7/32", Some(t(100))));
                s.upsert(stored_entry("203.0.113.8/32", Some(t(1000))));
                s.denied.insert(net("192.0.2.0/24"));
            })
            .await
            .unwrap();

        let applied = h.manager.restore(t(400)).await;
        assert_eq!(applied, 1);
        assert_eq!(
            h.applier.calls(),
            vec![
                Call::Block(net("203.0.113.8/32"), None, Some(Duration::from_secs(600))),
                Call::Block(net("192.0.2.0/24"), None, None),
                Call::Unblock(net("203.0.113.7/32")),
            ]
        );
        let stored = store.load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert_eq!(stored.blocks[0].target, net("203.0.113.8/32"));
        assert!(h.manager.deny_targets().contains(&net("192.0.2.0/24")));
    }

    #[tokio::test]
    async fn test_restore_twice_converges() {
        let mut h = harness();
        let store = h.manager.store().clone();
        store
            .with_lock(|s| s.upsert(stored_entry("203.0.113.8/32", None)))
            .await
            .unwrap();

        h.manager.restore(t(0)).await;
        h.manager.restore(t(10)).await;
        assert_eq!(h.applier.unblock_count(), 0);
        assert_eq!(store.load().unwrap().blocks.len(), 1);
        assert!(h.manager.deny_targets().is_empty());
    }

    #[tokio::test]
    async fn test_enforced_deny_recorded_in_store() {
        let mut h = harness();
        let desired: BTreeSet<IpNet> = [net("192.0.2.0/24")].into_iter().collect();
        h.manager.reconcile_deny(&desired).await;
        assert_eq!(h.manager.store().load().unwrap().denied, desired);

        h.manager.reconcile_deny(&BTreeSet::new()).await;
        assert!(h.manager.store().load().unwrap().denied.is_empty());
    }

    /// A second manager on the same store, as `blockwarden block` runs it.
    fn operator(h: &Harness) -> (Arc<MockApplier>, BlockManager) {
        let applier = Arc::new(MockApplier::new());
        let manager = BlockManager::new(
            applier.clone(),
            Arc::new(RecordingDispatcher::new()),
            Arc::new(Config::default()),
            h.manager.store().clone(),
        );
        (applier, manager)
    }

    #[tokio::test]
    async fn test_trigger_respects_operator_block_made_meanwhile() {
        let mut h = harness();
        // The daemon's cached table is empty when the operator acts
        h.manager.refresh_from_store();
        let (cli_applier, mut cli) = operator(&h);
        cli.block_manual(net("203.0.113.7/32"), None, None, "known attacker", t(0))
            .await
            .unwrap();

        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(5)).await;
        assert_eq!(outcome, TriggerOutcome::AlreadyBlocked(net("203.0.113.7/32")));
        assert!(h.applier.calls().is_empty());
        assert_eq!(cli_applier.block_count(), 1);

        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks.len(), 1);
        assert_eq!(stored.blocks[0].origin, Origin::Manual);
        assert_eq!(stored.blocks[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_trigger_keeps_temporary_operator_block() {
        let mut h = harness();
        let (_, mut cli) = operator(&h);
        cli.block_manual(
            net("203.0.113.7/32"),
            Some(Duration::from_secs(60)),
            None,
            "short ban",
            t(0),
        )
        .await
        .unwrap();

        let outcome = h.manager.trigger(trigger("203.0.113.7"), t(5)).await;
        assert_eq!(outcome, TriggerOutcome::AlreadyBlocked(net("203.0.113.7/32")));
        let stored = h.manager.store().load().unwrap();
        assert_eq!(stored.blocks[0].reason, "short ban");
        assert_eq!(stored.blocks[0].expires_at, Some(t(60)));
    }

    #[tokio::test]
    async fn test_manual_block_over_daemon_block_adds_no_rule() {
        let mut h = harness();
        h.manager.trigger(trigger("203.0.113.7"), t(0)).await;
        let (cli_applier, mut cli) = operator(&h);
        let entry = cli
            .block_manual(net("203.0.113.7/32"), None, None, "make it permanent", t(10))
            .await
            .unwrap();

        assert!(entry.is_permanent());
        assert!(cli_applier.calls().is_empty());
        assert_eq!(h.manager.store().load().unwrap().blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_huge_durations_do_not_overflow() {
        let mut h = harness();
        let entry = h
            .manager
            .block_manual(
                net("203.0.113.7/32"),
                Some(Duration::from_secs(u64::MAX)),
                None,
                "forever and then some",
                t(0),
            )
            .await
            .unwrap();
        let expires_at = entry.expires_at.unwrap();
        assert!(expires_at > t(0));
        assert!(!entry.is_expired(t(1_000_000_000)));
        assert_eq!(h.manager.store().load().unwrap().blocks[0].expires_at, Some(expires_at));
    }

    struct ListedEverywhere;

    #[async_trait::async_trait]
    impl DnsblChecker for ListedEverywhere {
        async fn check(&self, _address: IpAddr) -> dnsbl::DnsblResult {
            dnsbl::DnsblResult::listed("zen.example.org")
        }
    }

    #[tokio::test]
    async fn test_dnsbl_verdict_attached_to_alert() {
        let mut h = harness();
        h.manager = h.manager.with_dnsbl(Arc::new(ListedEverywhere));
        h.manager.trigger(trigger("203.0.113.7"), t(40)).await;

        let sent = h.alerts.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].dnsbl,
            Some(dnsbl::DnsblResult::listed("zen.example.org"))
        );
    }

    #[test]
    fn test_remaining_from_floor() {
        assert_eq!(remaining_from(t(10), t(20)), Duration::from_secs(1));
        assert_eq!(remaining_from(t(100), t(40)), Duration::from_secs(60));
    }
}
