//! Firewall enforcement.
//!
//! The engine never talks to the packet filter directly. It goes through the
//! [`FirewallApplier`] trait: the production [`CommandApplier`] runs configured
//! command templates, [`DryRunApplier`] only logs.
//!
//! Rules outlive the daemon process. The store is the record of what should
//! be on the firewall; a restart re-applies it through an applier that skips
//! rules already present.

mod command;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub use command::CommandApplier;

use crate::error::ApplyError;

/// An inclusive port range; a single port has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Ports a block applies to. `None` at the call sites means all ports.
///
/// Written as `22`, `"22,80"` or `"1000-2000,8080"` in configuration and on
/// the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortSpecRepr", into = "String")]
pub struct PortSpec(Vec<PortRange>);

#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpecRepr {
    Single(u16),
    List(Vec<u16>),
    Text(String),
}

impl TryFrom<PortSpecRepr> for PortSpec {
    type Error = String;

    fn try_from(repr: PortSpecRepr) -> Result<Self, Self::Error> {
        match repr {
            PortSpecRepr::Single(port) => PortSpec::new(vec![PortRange {
                start: port,
                end: port,
            }]),
            PortSpecRepr::List(ports) => PortSpec::new(
                ports
                    .into_iter()
                    .map(|p| PortRange { start: p, end: p })
                    .collect(),
            ),
            PortSpecRepr::Text(text) => text.parse(),
        }
    }
}

impl PortSpec {
    pub fn new(mut ranges: Vec<PortRange>) -> Result<Self, String> {
        if ranges.is_empty() {
            return Err("Port list cannot be empty".to_string());
        }
        for r in &ranges {
            if r.start == 0 || r.start > r.end {
                return Err(format!("Invalid port range {}-{}", r.start, r.end));
            }
        }
        ranges.sort();
        ranges.dedup();
        Ok(Self(ranges))
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.0
    }

    /// iptables multiport form: ranges written `start:end`.
    pub fn to_multiport(&self) -> String {
        self.0
            .iter()
            .map(|r| {
                if r.start == r.end {
                    r.start.to_string()
                } else {
                    format!("{}:{}", r.start, r.end)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid port '{}'", p.trim()))
        };

        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once(['-', ':']) {
                Some((a, b)) => PortRange {
                    start: parse_port(a)?,
                    end: parse_port(b)?,
                },
                None => {
                    let p = parse_port(part)?;
                    PortRange { start: p, end: p }
                }
            };
            ranges.push(range);
        }
        PortSpec::new(ranges)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|r| {
                if r.start == r.end {
                    r.start.to_string()
                } else {
                    format!("{}-{}", r.start, r.end)
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

/// Packet-filter collaborator.
///
/// Implementations must be idempotent: blocking a target that already has
/// its rule, or unblocking one that has none, succeeds without a change. The
/// caller bounds every call with a timeout.
#[async_trait]
pub trait FirewallApplier: Send + Sync {
    /// Block `target`. `ports == None` blocks all ports, `duration == None` is
    /// permanent.
    async fn block(
        &self,
        target: IpNet,
        ports: Option<PortSpec>,
        duration: Option<Duration>,
    ) -> Result<(), ApplyError>;

    /// Remove the block on `target` that was applied with `ports`.
    async fn unblock(&self, target: IpNet, ports: Option<PortSpec>) -> Result<(), ApplyError>;
}

/// Applier used when the firewall is in dry-run mode: logs and succeeds.
#[derive(Debug, Default, Clone)]
pub struct DryRunApplier;

#[async_trait]
impl FirewallApplier for DryRunApplier {
    async fn block(
        &self,
        target: IpNet,
        ports: Option<PortSpec>,
        duration: Option<Duration>,
    ) -> Result<(), ApplyError> {
        info!(
            "[dry-run] block {} ports={} ttl={}",
            target,
            ports.map(|p| p.to_string()).unwrap_or_else(|| "all".to_string()),
            duration
                .map(crate::validation::format_interval)
                .unwrap_or_else(|| "permanent".to_string())
        );
        Ok(())
    }

    async fn unblock(&self, target: IpNet, ports: Option<PortSpec>) -> Result<(), ApplyError> {
        info!(
            "[dry-run] unblock {} ports={}",
            target,
            ports.map(|p| p.to_string()).unwrap_or_else(|| "all".to_string())
        );
        Ok(())
    }
}

/// Check if running as root (effective UID == 0)
///
/// Firewall changes need CAP_NET_ADMIN; UID 0 covers the common case of
/// running with sudo or as a system service.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_parse() {
        let spec: PortSpec = "80, 22,1000-2000".parse().unwrap();
        assert_eq!(spec.to_string(), "22,80,1000-2000");
        assert_eq!(spec.ranges().len(), 3);
    }

    #[test]
    fn test_port_spec_colon_range() {
        let spec: PortSpec = "6000:6010".parse().unwrap();
        assert_eq!(spec.to_string(), "6000-6010");
    }

    #[test]
    fn test_port_spec_multiport_form() {
        let spec: PortSpec = "8080,20-21,443".parse().unwrap();
        assert_eq!(spec.to_multiport(), "20:21,443,8080");
    }

    #[test]
    fn test_port_spec_invalid() {
        assert!("".parse::<PortSpec>().is_err());
        assert!("0".parse::<PortSpec>().is_err());
        assert!("70000".parse::<PortSpec>().is_err());
        assert!("90-80".parse::<PortSpec>().is_err());
        assert!("ssh".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_port_spec_yaml_forms() {
        let single: PortSpec = serde_yaml::from_str("22").unwrap();
        assert_eq!(single.to_string(), "22");
        let list: PortSpec = serde_yaml::from_str("[443, 80]").unwrap();
        assert_eq!(list.to_string(), "80,443");
        let text: PortSpec = serde_yaml::from_str("\"25,465,587\"").unwrap();
        assert_eq!(text.to_string(), "25,465,587");
        assert!(serde_yaml::from_str::<PortSpec>("\"nope\"").is_err());
    }

    #[test]
    fn test_port_spec_json_serializes_as_string() {
        let spec: PortSpec = "22,80".parse().unwrap();
        assert_eq!(serde_json::to_string(&spec).unwrap(), "\"22,80\"");
    }

    #[tokio::test]
    async fn test_dry_run_applier_succeeds() {
        let applier = DryRunApplier;
        let target: IpNet = "203.0.113.7/32".parse().unwrap();
        assert!(applier
            .block(target, None, Some(Duration::from_secs(3600)))
            .await
            .is_ok());
        assert!(applier.unblock(target, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_applier_records_calls() {
        let applier = mock::MockApplier::new();
        let target: IpNet = "198.51.100.1/32".parse().unwrap();
        applier.block(target, None, None).await.unwrap();
        *applier.fail_unblock.lock().unwrap() = true;
        assert!(applier.unblock(target, None).await.is_err());
        assert_eq!(applier.block_count(), 1);
        assert_eq!(applier.unblock_count(), 1);
    }
}
