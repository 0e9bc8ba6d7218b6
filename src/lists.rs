//! List resolver: allow / ignore / deny precedence.
//!
//! List files hold one address or CIDR per line. `#` starts a comment and
//! `Include <path>` pulls in another file (relative to the including file,
//! nested at most [`MAX_INCLUDE_DEPTH`] deep, cycles skipped).
//!
//! A reload builds a complete new [`ListSnapshot`] and swaps it in, so a
//! resolution that already holds a snapshot keeps a consistent view.

use ipnet::IpNet;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::ListsConfig;
use crate::validation::validate_ip_or_cidr;

/// Maximum `Include` nesting below a top-level list file.
pub const MAX_INCLUDE_DEPTH: usize = 4;

/// Result of checking an address against the lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListDecision {
    Allow,
    Ignore,
    Deny,
    Unlisted,
}

impl ListDecision {
    /// Only unlisted addresses may receive a new dynamic block.
    pub fn permits_block(&self) -> bool {
        matches!(self, ListDecision::Unlisted)
    }
}

impl std::fmt::Display for ListDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ListDecision::Allow => "allow",
            ListDecision::Ignore => "ignore",
            ListDecision::Deny => "deny",
            ListDecision::Unlisted => "unlisted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub network: IpNet,
    pub comment: Option<String>,
    pub source_file: PathBuf,
}

/// One immutable, fully-loaded view of all lists.
#[derive(Debug, Default)]
pub struct ListSnapshot {
    allow: Vec<ListEntry>,
    ignore: Vec<ListEntry>,
    deny: Vec<ListEntry>,
    /// Every file that contributed (or was looked for) and its mtime
    files: Vec<(PathBuf, Option<SystemTime>)>,
}

impl ListSnapshot {
    pub fn load(config: &ListsConfig) -> Self {
        let mut files = Vec::new();
        let allow = load_list(&config.allow, &mut files);
        let ignore = load_list(&config.ignore, &mut files);
        let deny = load_list(&config.deny, &mut files);
        Self {
            allow,
            ignore,
            deny,
            files,
        }
    }

    /// Allow, then ignore (including loopback and unspecified), then deny.
    pub fn decision(&self, address: IpAddr) -> ListDecision {
        self.lookup(address).0
    }

    /// Decision plus the entry that produced it, if any.
    pub fn lookup(&self, address: IpAddr) -> (ListDecision, Option<&ListEntry>) {
        if let Some(entry) = find(&self.allow, address) {
            return (ListDecision::Allow, Some(entry));
        }
        if let Some(entry) = find(&self.ignore, address) {
            return (ListDecision::Ignore, Some(entry));
        }
        if address.is_loopback() || address.is_unspecified() {
            return (ListDecision::Ignore, None);
        }
        if let Some(entry) = find(&self.deny, address) {
            return (ListDecision::Deny, Some(entry));
        }
        (ListDecision::Unlisted, None)
    }

    /// Whether any allow or ignore entry overlaps `network`.
    pub fn protects(&self, network: &IpNet) -> bool {
        self.allow
            .iter()
            .chain(self.ignore.iter())
            .any(|e| e.network.contains(network) || network.contains(&e.network))
    }

    /// Distinct deny networks.
    pub fn deny_networks(&self) -> BTreeSet<IpNet> {
        self.deny.iter().map(|e| e.network).collect()
    }

    /// Deny networks that may go to the firewall: anything overlapping an
    /// allow or ignore entry, loopback or the unspecified address is held back.
    pub fn enforceable_deny(&self) -> BTreeSet<IpNet> {
        self.deny_networks()
            .into_iter()
            .filter(|net| {
                let reserved = [
                    IpAddr::from([127, 0, 0, 1]),
                    IpAddr::from([0, 0, 0, 0]),
                    std::net::Ipv6Addr::LOCALHOST.into(),
                    std::net::Ipv6Addr::UNSPECIFIED.into(),
                ];
                if self.protects(net) || reserved.iter().any(|a| net.contains(a)) {
                    warn!("Deny entry {} overlaps a protected address, not enforcing", net);
                    return false;
                }
                true
            })
            .collect()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.allow.len(), self.ignore.len(), self.deny.len())
    }

    fn changed_on_disk(&self) -> bool {
        self.files.iter().any(|(path, mtime)| modified(path) != *mtime)
    }
}

fn find(entries: &[ListEntry], address: IpAddr) -> Option<&ListEntry> {
    entries.iter().find(|e| e.network.contains(&address))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn load_list(paths: &[PathBuf], files: &mut Vec<(PathBuf, Option<SystemTime>)>) -> Vec<ListEntry> {
    let mut entries = Vec::new();
    for path in paths {
        let mut visited = HashSet::new();
        load_file(path, 0, &mut visited, files, &mut entries);
    }
    entries
}

fn load_file(
    path: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
    files: &mut Vec<(PathBuf, Option<SystemTime>)>,
    entries: &mut Vec<ListEntry>,
) {
    files.push((path.to_path_buf(), modified(path)));

    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(key) {
        warn!("Include cycle at {}, skipping", path.display());
        return;
    }

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if depth == 0 {
                debug!("List file {} does not exist, treating as empty", path.display());
            } else {
                warn!("Included list file {} does not exist", path.display());
            }
            return;
        }
        Err(e) => {
            warn!("Failed to read list file {}: {}", path.display(), e);
            return;
        }
    };

    for (lineno, raw) in content.lines().enumerate() {
        let (body, comment) = match raw.split_once('#') {
            Some((b, c)) => (b.trim(), Some(c.trim()).filter(|c| !c.is_empty())),
            None => (raw.trim(), None),
        };
        if body.is_empty() {
            continue;
        }

        let mut words = body.split_whitespace();
        let first = words.next().unwrap_or_default();
        if first.eq_ignore_ascii_case("include") {
            let Some(target) = words.next() else {
                warn!("{}:{}: Include without a path", path.display(), lineno + 1);
                continue;
            };
            if depth >= MAX_INCLUDE_DEPTH {
                warn!(
                    "{}:{}: Include nested deeper than {}, skipping {}",
                    path.display(),
                    lineno + 1,
                    MAX_INCLUDE_DEPTH,
                    target
                );
                continue;
            }
            let target = resolve_include(path, target);
            load_file(&target, depth + 1, visited, files, entries);
            continue;
        }

        match validate_ip_or_cidr(first) {
            Ok(network) => entries.push(ListEntry {
                network,
                comment: comment.map(str::to_string),
                source_file: path.to_path_buf(),
            }),
            Err(e) => warn!("{}:{}: {}, skipping", path.display(), lineno + 1, e),
        }
    }
}

fn resolve_include(from: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        from.parent()
            .map(|dir| dir.join(target))
            .unwrap_or_else(|| target.to_path_buf())
    }
}

/// Deny networks added and removed between two snapshots.
pub fn deny_diff(old: &ListSnapshot, new: &ListSnapshot) -> (Vec<IpNet>, Vec<IpNet>) {
    let before = old.deny_networks();
    let after = new.deny_networks();
    let added = after.difference(&before).copied().collect();
    let removed = before.difference(&after).copied().collect();
    (added, removed)
}

/// Holds the current snapshot and reloads it when list files change.
#[derive(Debug)]
pub struct ListResolver {
    config: RwLock<ListsConfig>,
    current: RwLock<Arc<ListSnapshot>>,
}

impl ListResolver {
    pub fn load(config: &ListsConfig) -> Self {
        let snapshot = ListSnapshot::load(config);
        let (a, i, d) = snapshot.counts();
        info!("Loaded lists: {} allow, {} ignore, {} deny", a, i, d);
        Self {
            config: RwLock::new(config.clone()),
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<ListSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn decision(&self, address: IpAddr) -> ListDecision {
        self.snapshot().decision(address)
    }

    /// Reload when any contributing file's mtime moved. Returns the previous
    /// snapshot when a swap happened.
    pub fn reload_if_changed(&self) -> Option<Arc<ListSnapshot>> {
        if !self.snapshot().changed_on_disk() {
            return None;
        }
        Some(self.reload())
    }

    /// Switch to new list paths (configuration reload) and reload now.
    pub fn set_config(&self, config: &ListsConfig) -> Arc<ListSnapshot> {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        self.reload()
    }

    fn reload(&self) -> Arc<ListSnapshot> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();
        let snapshot = Arc::new(ListSnapshot::load(&config));
        let (a, i, d) = snapshot.counts();
        info!("Reloaded lists: {} allow, {} ignore, {} deny", a, i, d);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, snapshot)
    }
}
