//! Failure ledger: sliding-window failure counts per (address, classification).
//!
//! Every retained event satisfies `now - t < window`, where the window comes
//! from the classification's policy. Keys whose events have all aged out are
//! removed as soon as that is observed, so idle noise does not accumulate.
//! The ledger is in-memory only; a restart starts counting from zero.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::utils::chrono_duration;

/// Sample lines kept per record for alert evidence.
pub const MAX_SAMPLES: usize = 5;

type Key = (IpAddr, String);

#[derive(Debug, Default)]
struct FailureRecord {
    /// (timestamp, weight), oldest first
    events: VecDeque<(DateTime<Utc>, u32)>,
    total: u64,
    samples: VecDeque<String>,
}

impl FailureRecord {
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(&(t, weight)) = self.events.front() {
            if now - t < window {
                break;
            }
            self.events.pop_front();
            self.total -= weight as u64;
        }
    }
}

pub struct FailureLedger {
    settings: Arc<dyn Settings>,
    records: HashMap<Key, FailureRecord>,
}

impl FailureLedger {
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self {
            settings,
            records: HashMap::new(),
        }
    }

    /// Swap in reloaded settings; existing counts are kept.
    pub fn set_settings(&mut self, settings: Arc<dyn Settings>) {
        self.settings = settings;
    }

    fn window(&self, classification: &str) -> chrono::Duration {
        chrono_duration(self.settings.policy(classification).window)
    }

    /// Record `weight` failures at `now` and return the count in the window.
    pub fn record(
        &mut self,
        address: IpAddr,
        classification: &str,
        weight: u32,
        now: DateTime<Utc>,
    ) -> u64 {
        self.record_inner(address, classification, weight, now, None)
    }

    /// Like [`record`](Self::record), also keeping `line` as evidence.
    pub fn record_with_sample(
        &mut self,
        address: IpAddr,
        classification: &str,
        weight: u32,
        now: DateTime<Utc>,
        line: &str,
    ) -> u64 {
        self.record_inner(address, classification, weight, now, Some(line))
    }

    fn record_inner(
        &mut self,
        address: IpAddr,
        classification: &str,
        weight: u32,
        now: DateTime<Utc>,
        line: Option<&str>,
    ) -> u64 {
        let window = self.window(classification);
        let record = self
            .records
            .entry((address, classification.to_string()))
            .or_default();

        record.events.push_back((now, weight));
        record.total += weight as u64;
        if let Some(line) = line {
            if record.samples.len() == MAX_SAMPLES {
                record.samples.pop_front();
            }
            record.samples.push_back(crate::utils::truncate(line, 512));
        }
        record.prune(now, window);

        let total = record.total;
        if record.events.is_empty() {
            self.records.remove(&(address, classification.to_string()));
        }
        total
    }

    /// Current count without recording anything.
    pub fn count(&self, address: IpAddr, classification: &str, now: DateTime<Utc>) -> u64 {
        let window = self.window(classification);
        self.records
            .get(&(address, classification.to_string()))
            .map(|r| {
                r.events
                    .iter()
                    .filter(|(t, _)| now - *t < window)
                    .map(|(_, w)| *w as u64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Recent sample lines for a key, oldest first.
    pub fn samples(&self, address: IpAddr, classification: &str) -> Vec<String> {
        self.records
            .get(&(address, classification.to_string()))
            .map(|r| r.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop expired events everywhere and remove empty keys.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        let settings = Arc::clone(&self.settings);
        self.records.retain(|(_, classification), record| {
            let window = chrono_duration(settings.policy(classification).window);
            record.prune(now, window);
            !record.events.is_empty()
        });
    }

    /// Number of live (address, classification) keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
