//! DNS blocklist lookups used to annotate block alerts.
//!
//! Only the collaborator seam lives here; deployments plug in their own
//! checker. Every lookup is bounded, and a timeout is reported as
//! inconclusive rather than as "not listed".

use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsblResult {
    pub listed: bool,
    pub detail: Option<String>,
    pub timed_out: bool,
}

impl DnsblResult {
    pub fn listed(detail: impl Into<String>) -> Self {
        Self {
            listed: true,
            detail: Some(detail.into()),
            timed_out: false,
        }
    }

    pub fn clean() -> Self {
        Self::default()
    }

    pub fn inconclusive() -> Self {
        Self {
            listed: false,
            detail: None,
            timed_out: true,
        }
    }

    pub fn describe(&self) -> String {
        match (self.timed_out, self.listed, &self.detail) {
            (true, _, _) => "inconclusive (lookup timed out)".to_string(),
            (false, true, Some(d)) => format!("listed ({})", d),
            (false, true, None) => "listed".to_string(),
            (false, false, _) => "not listed".to_string(),
        }
    }
}

#[async_trait]
pub trait DnsblChecker: Send + Sync {
    async fn check(&self, address: IpAddr) -> DnsblResult;
}

/// Run `checker` for `address`, giving up after `timeout`.
pub async fn check_with_timeout(
    checker: &Arc<dyn DnsblChecker>,
    address: IpAddr,
    timeout: Duration,
) -> DnsblResult {
    match tokio::time::timeout(timeout, checker.check(address)).await {
        Ok(result) => {
            debug!("DNSBL check for {}: {}", address, result.describe());
            result
        }
        Err(_) => {
            warn!(
                "DNSBL check for {} timed out after {:?}, result inconclusive",
                address, timeout
            );
            DnsblResult::inconclusive()
        }
    }
}
