//! Error types for blockwarden.
//!
//! Components return these typed errors for expected conditions; commands and
//! `main` wrap them in `anyhow` with context.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or unusable configuration. Fatal at startup, ignored on reload.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid rule '{rule}' in rule set '{rule_set}': {reason}")]
    Rule {
        rule_set: String,
        rule: String,
        reason: String,
    },

    #[error("Unknown rule set '{rule_set}' referenced by source {path:?}")]
    UnknownRuleSet { path: PathBuf, rule_set: String },

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("No log sources configured")]
    NoSources,

    #[error("None of the configured log sources is readable")]
    NoReadableSources,
}

/// Failure while polling a log source.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// State-integrity failures of the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open lock file {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} waiting for state lock")]
    LockTimeout(Duration),

    #[error("State file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure of a firewall applier call.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Firewall command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Firewall command failed: {0}")]
    Failed(String),

    #[error("Failed to run firewall command: {0}")]
    Spawn(String),
}

/// Failure of a combined firewall + store operation (administrative paths).
#[derive(Error, Debug)]
pub enum BlockError {
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
