//! Persistent block state (`state.json`).
//!
//! Every mutation happens under the exclusive state lock and is written with
//! temp file + fsync + rename, so readers only ever see a complete file. The
//! daemon and the administrative CLI share this type and the same lock.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::enforcer::PortSpec;
use crate::error::StoreError;
use crate::lock::LockGuard;
use crate::utils::chrono_duration;

/// Who created a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Daemon,
    Manual,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Origin::Daemon => "daemon",
            Origin::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub target: IpNet,
    pub reason: String,
    pub classification: String,
    pub created_at: DateTime<Utc>,
    /// `None` is permanent
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` is all ports
    pub ports: Option<PortSpec>,
    pub origin: Origin,
}

impl BlockEntry {
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// On-disk document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub blocks: Vec<BlockEntry>,
    /// Creation times of temporary blocks per address, for escalation
    pub history: BTreeMap<String, Vec<DateTime<Utc>>>,
    /// Deny-list networks the daemon holds a firewall rule for
    pub denied: BTreeSet<IpNet>,
}

impl PersistedState {
    /// Entry whose target is exactly `target`.
    pub fn find(&self, target: &IpNet) -> Option<&BlockEntry> {
        self.blocks.iter().find(|e| e.target == *target)
    }

    pub fn find_mut(&mut self, target: &IpNet) -> Option<&mut BlockEntry> {
        self.blocks.iter_mut().find(|e| e.target == *target)
    }

    /// First entry whose target contains `address`.
    pub fn covering(&self, address: IpAddr) -> Option<&BlockEntry> {
        self.blocks.iter().find(|e| e.target.contains(&address))
    }

    /// Insert or replace the entry for `entry.target`.
    pub fn upsert(&mut self, entry: BlockEntry) {
        match self.find_mut(&entry.target) {
            Some(existing) => *existing = entry,
            None => self.blocks.push(entry),
        }
    }

    pub fn remove(&mut self, target: &IpNet) -> Option<BlockEntry> {
        let idx = self.blocks.iter().position(|e| e.target == *target)?;
        Some(self.blocks.remove(idx))
    }

    pub fn daemon_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|e| e.origin == Origin::Daemon)
            .count()
    }

    /// Daemon-originated entries, oldest first.
    pub fn oldest_daemon_entries(&self) -> Vec<BlockEntry> {
        let mut entries: Vec<BlockEntry> = self
            .blocks
            .iter()
            .filter(|e| e.origin == Origin::Daemon)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Temporary blocks recorded for `address` within `interval` before `now`.
    pub fn recent_blocks(&self, address: IpAddr, now: DateTime<Utc>, interval: Duration) -> usize {
        let interval = chrono_duration(interval);
        self.history
            .get(&address.to_string())
            .map(|times| times.iter().filter(|t| now - **t < interval).count())
            .unwrap_or(0)
    }

    pub fn record_history(&mut self, address: IpAddr, at: DateTime<Utc>) {
        self.history.entry(address.to_string()).or_default().push(at);
    }

    /// Drop history older than `interval`, and addresses left with none.
    pub fn prune_history(&mut self, now: DateTime<Utc>, interval: Duration) {
        let interval = chrono_duration(interval);
        self.history.retain(|_, times| {
            times.retain(|t| now - *t < interval);
            !times.is_empty()
        });
    }
}

/// Identity of the state file as of a read: (mtime, length).
pub type Fingerprint = (SystemTime, u64);

#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(state_file: PathBuf, lock_file: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            state_file,
            lock_file,
            lock_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.state_file(),
            config.state_lock_file(),
            config.lock_timeout.get(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    /// Read the state file. A missing file is an empty state.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let content = match fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.state_file.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.state_file.clone(),
            source,
        })
    }

    /// Take the state lock, waiting at most the configured timeout.
    ///
    /// Callers that must decide, call the firewall and record the result as
    /// one step hold the guard across all three.
    pub async fn lock(&self) -> Result<LockGuard, StoreError> {
        LockGuard::acquire(&self.lock_file, self.lock_timeout).await
    }

    /// Write `state` atomically, bumping its version. Requires the lock.
    pub fn save(&self, _lock: &LockGuard, state: &mut PersistedState) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.state_file.clone(),
            source,
        };

        let dir = self
            .state_file
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        state.version += 1;
        state.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(state)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.state_file).map_err(|e| io_err(e.error))?;

        // Make the rename itself durable
        if let Ok(d) = fs::File::open(dir) {
            d.sync_all().ok();
        }
        Ok(())
    }

    /// Lock, load, let `f` mutate, save if anything changed, unlock.
    ///
    /// The state is always re-read under the lock, so changes made by another
    /// process since the caller's last read are never overwritten.
    pub async fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut PersistedState) -> R,
    ) -> Result<(R, PersistedState), StoreError> {
        let guard = self.lock().await?;
        let mut state = self.load()?;
        let before = state.clone();
        let result = f(&mut state);
        if state != before {
            self.save(&guard, &mut state)?;
        }
        Ok((result, state))
    }

    /// (mtime, length) of the state file, if it exists.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let meta = fs::metadata(&self.state_file).ok()?;
        Some((meta.modified().ok()?, meta.len()))
    }
}
