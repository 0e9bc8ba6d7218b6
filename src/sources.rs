//! Source registry: the set of monitored log files and their rule sets.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::error::ConfigError;
use crate::reader::LogSource;

/// Owns one [`LogSource`] per configured path.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<LogSource>,
}

impl SourceRegistry {
    /// Build the registry at daemon start. Every source starts at the current
    /// end of its file. A path listed twice keeps its first rule set.
    pub fn from_config(configs: &[SourceConfig], read_budget: u64) -> Self {
        let mut registry = Self::default();
        registry.reconfigure(configs, read_budget);
        registry
    }

    /// Apply a reloaded source list.
    ///
    /// Sources whose path is unchanged keep their read position; new paths
    /// start at end of file; paths no longer configured are dropped.
    pub fn reconfigure(&mut self, configs: &[SourceConfig], read_budget: u64) {
        let mut existing: HashMap<PathBuf, LogSource> = self
            .sources
            .drain(..)
            .map(|s| (s.path().to_path_buf(), s))
            .collect();

        let mut next = Vec::with_capacity(configs.len());
        for cfg in configs {
            if let Some(first) = next.iter().find(|s: &&LogSource| s.path() == cfg.path) {
                warn!(
                    "Log source {} listed more than once, using rule set '{}'",
                    cfg.path.display(),
                    first.rule_set()
                );
                continue;
            }
            let source = match existing.remove(&cfg.path) {
                Some(mut kept) => {
                    kept.set_rule_set(cfg.rule_set.clone());
                    kept.set_budget(read_budget);
                    kept
                }
                None => {
                    info!(
                        "Watching {} with rule set '{}'",
                        cfg.path.display(),
                        cfg.rule_set
                    );
                    LogSource::at_end(&cfg.path, &cfg.rule_set, read_budget)
                }
            };
            next.push(source);
        }

        for path in existing.keys() {
            info!("No longer watching {}", path.display());
        }
        self.sources = next;
    }

    /// Startup check: at least one configured source must be readable.
    pub fn check_readable(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let readable = self
            .sources
            .iter()
            .filter(|s| std::fs::File::open(s.path()).is_ok())
            .count();
        if readable == 0 {
            return Err(ConfigError::NoReadableSources);
        }
        Ok(())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogSource> {
        self.sources.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogSource> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::DEFAULT_READ_BUDGET;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn cfg(path: &std::path::Path, rule_set: &str) -> SourceConfig {
        SourceConfig {
            path: path.to_path_buf(),
            rule_set: rule_set.to_string(),
        }
    }

    fn append(path: &std::path::Path, data: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    #[test]
    fn test_duplicate_paths_collapsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let registry = SourceRegistry::from_config(
            &[cfg(&path, "sshd"), cfg(&path, "ftp")],
            DEFAULT_READ_BUDGET,
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.iter().next().unwrap().rule_set(), "sshd");
    }

    #[test]
    fn test_reconfigure_keeps_offsets() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        append(&a, "one\n");
        append(&b, "x\n");

        let mut registry = SourceRegistry::from_config(&[cfg(&a, "sshd")], DEFAULT_READ_BUDGET);
        append(&a, "two\n");

        registry.reconfigure(&[cfg(&a, "mail"), cfg(&b, "sshd")], DEFAULT_READ_BUDGET);
        assert_eq!(registry.len(), 2);

        let mut sources: Vec<_> = registry.iter_mut().collect();
        // `a` kept its position (before "two"), `b` starts at its end
        assert_eq!(sources[0].rule_set(), "mail");
        assert_eq!(sources[0].poll().unwrap().lines, vec!["two"]);
        assert!(sources[1].poll().unwrap().lines.is_empty());
    }

    #[test]
    fn test_reconfigure_drops_removed() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let mut registry = SourceRegistry::from_config(&[cfg(&a, "sshd")], DEFAULT_READ_BUDGET);
        registry.reconfigure(&[], DEFAULT_READ_BUDGET);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_check_readable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.log");
        let present = dir.path().join("present.log");

        let registry = SourceRegistry::from_config(&[cfg(&missing, "sshd")], DEFAULT_READ_BUDGET);
        assert!(matches!(
            registry.check_readable(),
            Err(ConfigError::NoReadableSources)
        ));

        append(&present, "");
        let registry = SourceRegistry::from_config(
            &[cfg(&missing, "sshd"), cfg(&present, "sshd")],
            DEFAULT_READ_BUDGET,
        );
        assert!(registry.check_readable().is_ok());

        let empty = SourceRegistry::default();
        assert!(matches!(empty.check_readable(), Err(ConfigError::NoSources)));
    }
}
