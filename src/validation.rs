//! Centralized validation functions for blockwarden.
//!
//! This module provides unified validation for:
//! - IP addresses and CIDR ranges (operator input and log-extracted candidates)
//! - Time intervals (`30s`, `5m`, `4h`, `1d`)

use anyhow::{bail, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;

/// Validate an IP address string and return the parsed IpAddr.
///
/// # Examples
/// ```
/// use blockwarden::validation::validate_ip;
/// assert!(validate_ip("192.168.1.1").is_ok());
/// assert!(validate_ip("::1").is_ok());
/// assert!(validate_ip("invalid").is_err());
/// ```
pub fn validate_ip(ip_str: &str) -> Result<IpAddr> {
    parse_address(ip_str).ok_or_else(|| anyhow::anyhow!("Invalid IP address: {}", ip_str))
}

/// Validate an IP address or CIDR string and return the parsed IpNet.
///
/// A plain address becomes a /32 (IPv4) or /128 (IPv6) network. Host bits of a
/// CIDR are cleared so `10.1.2.3/8` and `10.0.0.0/8` name the same block.
///
/// # Examples
/// ```
/// use blockwarden::validation::validate_ip_or_cidr;
/// assert!(validate_ip_or_cidr("192.168.1.1").is_ok());
/// assert!(validate_ip_or_cidr("192.168.0.0/24").is_ok());
/// assert!(validate_ip_or_cidr("invalid").is_err());
/// ```
pub fn validate_ip_or_cidr(ip_str: &str) -> Result<IpNet> {
    if ip_str.contains('/') {
        ip_str
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", ip_str))
    } else {
        let ip = validate_ip(ip_str)?;
        Ok(IpNet::from(ip))
    }
}

/// Parse an address candidate extracted from a log line.
///
/// Accepts only a complete IPv4 or IPv6 literal. IPv4-mapped IPv6 addresses
/// (`::ffff:192.0.2.1`) are normalised to their IPv4 form so one attacker has
/// one ledger key regardless of how the service logged it.
pub fn parse_address(candidate: &str) -> Option<IpAddr> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.len() > 45 {
        return None;
    }
    match candidate.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => Some(IpAddr::V4(v4)),
            None => Some(IpAddr::V6(v6)),
        },
        v4 => Some(v4),
    }
}

/// Longest interval accepted anywhere: 100 years.
pub const MAX_INTERVAL: Duration = Duration::from_secs(36_500 * 86_400);

/// Parse an interval like `30s`, `5m`, `4h` or `1d` into a Duration.
///
/// Values above [`MAX_INTERVAL`] are rejected; use `permanent` instead.
///
/// # Errors
/// Returns an error with a descriptive message if the interval is invalid.
///
/// # Examples
/// ```
/// use blockwarden::validation::parse_interval;
/// use std::time::Duration;
/// assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
/// assert!(parse_interval("invalid").is_err());
/// ```
pub fn parse_interval(interval: &str) -> Result<Duration> {
    if interval.is_empty() {
        bail!("Interval cannot be empty");
    }

    // Reject non-ASCII to prevent Unicode edge cases
    if !interval.is_ascii() {
        bail!("Invalid interval '{}'. Only ASCII characters allowed", interval);
    }

    if interval.len() < 2 {
        bail!(
            "Invalid interval '{}'. Use format like '30s', '5m', '4h', '1d'",
            interval
        );
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let multiplier: u64 = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => bail!(
            "Invalid interval '{}'. Suffix must be s, m, h, or d",
            interval
        ),
    };

    let value: u32 = num_part.parse().map_err(|_| {
        anyhow::anyhow!(
            "Invalid interval '{}'. Number part must be a positive integer",
            interval
        )
    })?;

    let duration = Duration::from_secs(value as u64 * multiplier);
    if duration > MAX_INTERVAL {
        bail!(
            "Invalid interval '{}'. Longest allowed is {}d",
            interval,
            MAX_INTERVAL.as_secs() / 86_400
        );
    }
    Ok(duration)
}

/// Format a Duration back into the largest exact interval unit.
pub fn format_interval(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
