//! Configuration management for blockwarden.
//!
//! The YAML file is deserialized into [`Config`]. The engine never reads
//! fields directly: it goes through the [`Settings`] trait, which `Config`
//! implements and which tests replace with `MockSettings` or a hand-built
//! `Config`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(test)]
use mockall::automock;

use crate::enforcer::PortSpec;
use crate::error::ConfigError;
use crate::validation::{format_interval, parse_interval};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blockwarden/config.yaml";

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like tokens
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A duration written as `30s`, `5m`, `4h` or `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(Duration);

impl Interval {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_duration(d: Duration) -> Self {
        Self(d)
    }

    pub fn get(&self) -> Duration {
        self.0
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_interval(&s).map(Self).map_err(|e| e.to_string())
    }
}

impl From<Interval> for String {
    fn from(i: Interval) -> Self {
        format_interval(i.0)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_interval(self.0))
    }
}

/// How long a block lasts: an interval or the literal `permanent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BlockDuration {
    Temporary(Duration),
    Permanent,
}

impl BlockDuration {
    /// `None` for permanent, matching the firewall applier's convention.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            BlockDuration::Temporary(d) => Some(*d),
            BlockDuration::Permanent => None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BlockDuration::Permanent)
    }
}

impl TryFrom<String> for BlockDuration {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.eq_ignore_ascii_case("permanent") {
            Ok(BlockDuration::Permanent)
        } else {
            parse_interval(&s)
                .map(BlockDuration::Temporary)
                .map_err(|e| e.to_string())
        }
    }
}

impl From<BlockDuration> for String {
    fn from(d: BlockDuration) -> Self {
        match d {
            BlockDuration::Temporary(d) => format_interval(d),
            BlockDuration::Permanent => "permanent".to_string(),
        }
    }
}

/// Resolved per-classification policy handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub threshold: u32,
    pub window: Duration,
    pub duration: BlockDuration,
    pub ports: Option<PortSpec>,
}

/// Resolved escalation settings; only present when escalation is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub count: u32,
    pub interval: Duration,
}

/// Typed settings accessor used by the engine.
///
/// Every method except `policy` has a default so fakes only need to provide
/// what a test cares about.
#[cfg_attr(test, automock)]
pub trait Settings: Send + Sync {
    /// Threshold, window, duration and port hint for a classification.
    /// Unknown classifications get the default policy.
    fn policy(&self, classification: &str) -> Policy;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn blocking_enabled(&self) -> bool {
        true
    }

    fn alerts_enabled(&self) -> bool {
        true
    }

    fn escalation(&self) -> Option<Escalation> {
        None
    }

    /// Maximum number of daemon-originated blocks; 0 means unlimited.
    fn block_limit(&self) -> usize {
        0
    }

    fn applier_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher cycle interval
    pub poll_interval: Interval,

    /// Directory holding state.json, state.lock and the instance lock
    pub state_dir: PathBuf,

    /// Master switch for firewall changes (false logs "would block" only)
    pub blocking_enabled: bool,

    /// Master switch for alert delivery
    pub alerts_enabled: bool,

    /// Maximum bytes read from one source per cycle
    pub read_budget: u64,

    /// How long to wait for the state lock
    pub lock_timeout: Interval,

    /// Policy for classifications without their own entry
    pub default_policy: PolicyConfig,

    /// Per-classification overrides of the default policy
    pub classifications: BTreeMap<String, ClassificationConfig>,

    /// Monitored log files
    pub sources: Vec<SourceConfig>,

    /// Additional rule sets; a name that matches a built-in set replaces it
    pub rule_sets: BTreeMap<String, Vec<RuleConfig>>,

    /// Allow / ignore / deny list files
    pub lists: ListsConfig,

    /// Temporary-to-permanent escalation
    pub escalation: EscalationConfig,

    /// Cap on daemon-originated blocks (0 = unlimited)
    pub block_limit: usize,

    /// Firewall command templates
    pub firewall: FirewallConfig,

    /// Alert destinations
    pub alerts: AlertsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Interval::from_secs(10),
            state_dir: PathBuf::from("/var/lib/blockwarden"),
            blocking_enabled: true,
            alerts_enabled: true,
            read_budget: 1024 * 1024,
            lock_timeout: Interval::from_secs(30),
            default_policy: PolicyConfig::default(),
            classifications: default_classifications(),
            sources: default_sources(),
            rule_sets: BTreeMap::new(),
            lists: ListsConfig::default(),
            escalation: EscalationConfig::default(),
            block_limit: 0,
            firewall: FirewallConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Compiles every rule set a source references, so a bad regex or a
    /// missing `addr` group is caught here rather than in the daemon loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.poll_interval.get().is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.read_budget == 0 {
            return Err(invalid("read_budget", "must be greater than zero"));
        }
        if self.firewall.timeout.get().is_zero() {
            return Err(invalid("firewall.timeout", "must be greater than zero"));
        }

        self.default_policy.check("default_policy")?;
        for (name, class) in &self.classifications {
            class.check(&format!("classifications.{}", name))?;
        }

        if self.escalation.enabled {
            if self.escalation.count < 2 {
                return Err(invalid("escalation.count", "must be at least 2"));
            }
            if self.escalation.interval.get().is_zero() {
                return Err(invalid("escalation.interval", "must be greater than zero"));
            }
        }

        let sample = [("addr", "192.0.2.1/32"), ("ports", "22"), ("ttl", "60")];
        for (key, template, required) in [
            ("firewall.block_command", &self.firewall.block_command, true),
            ("firewall.unblock_command", &self.firewall.unblock_command, true),
            ("firewall.check_command", &self.firewall.check_command, false),
            ("firewall.block_command_v6", &self.firewall.block_command_v6, true),
            ("firewall.unblock_command_v6", &self.firewall.unblock_command_v6, true),
            ("firewall.check_command_v6", &self.firewall.check_command_v6, false),
        ] {
            if template.trim().is_empty() {
                if required {
                    return Err(invalid(key, "command template cannot be empty"));
                }
                continue;
            }
            if let Err(e) = crate::cmd_abstraction::render_template(template, &sample) {
                return Err(invalid(key, &e.to_string()));
            }
        }

        // Compiling the rule book validates every rule set and every
        // source's reference to one.
        crate::rules::RuleBook::from_config(self)?;

        if self.alerts.webhook.enabled
            && !self.alerts.webhook.url.is_empty()
            && !self.alerts.webhook.url.starts_with("https://")
        {
            return Err(invalid("alerts.webhook.url", "must use HTTPS"));
        }

        if self.alerts.gotify.enabled
            && !self.alerts.gotify.url.is_empty()
            && !self.alerts.gotify.url.starts_with("https://")
        {
            return Err(invalid("alerts.gotify.url", "must use HTTPS"));
        }

        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn state_lock_file(&self) -> PathBuf {
        self.state_dir.join("state.lock")
    }
}

impl Settings for Config {
    fn policy(&self, classification: &str) -> Policy {
        let base = &self.default_policy;
        match self.classifications.get(classification) {
            Some(class) => Policy {
                threshold: class.threshold.unwrap_or(base.threshold),
                window: class.window.unwrap_or(base.window).get(),
                duration: class.duration.unwrap_or(base.duration),
                ports: class.ports.clone().or_else(|| base.ports.clone()),
            },
            None => Policy {
                threshold: base.threshold,
                window: base.window.get(),
                duration: base.duration,
                ports: base.ports.clone(),
            },
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval.get()
    }

    fn blocking_enabled(&self) -> bool {
        self.blocking_enabled
    }

    fn alerts_enabled(&self) -> bool {
        self.alerts_enabled
    }

    fn escalation(&self) -> Option<Escalation> {
        self.escalation.enabled.then(|| Escalation {
            count: self.escalation.count,
            interval: self.escalation.interval.get(),
        })
    }

    fn block_limit(&self) -> usize {
        self.block_limit
    }

    fn applier_timeout(&self) -> Duration {
        self.firewall.timeout.get()
    }
}

/// Policy applied to classifications without their own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub threshold: u32,
    pub window: Interval,
    pub duration: BlockDuration,
    pub ports: Option<PortSpec>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Interval::from_secs(300),
            duration: BlockDuration::Temporary(Duration::from_secs(3600)),
            ports: None,
        }
    }
}

impl PolicyConfig {
    fn check(&self, key: &str) -> Result<(), ConfigError> {
        check_policy_values(key, Some(self.threshold), Some(self.window), Some(self.duration))
    }
}

/// Per-classification policy; unset fields fall back to `default_policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub threshold: Option<u32>,
    pub window: Option<Interval>,
    pub duration: Option<BlockDuration>,
    pub ports: Option<PortSpec>,
}

impl ClassificationConfig {
    fn check(&self, key: &str) -> Result<(), ConfigError> {
        check_policy_values(key, self.threshold, self.window, self.duration)
    }
}

fn check_policy_values(
    key: &str,
    threshold: Option<u32>,
    window: Option<Interval>,
    duration: Option<BlockDuration>,
) -> Result<(), ConfigError> {
    let invalid = |field: &str, reason: &str| ConfigError::Invalid {
        key: format!("{}.{}", key, field),
        reason: reason.to_string(),
    };
    if threshold == Some(0) {
        return Err(invalid("threshold", "must be at least 1"));
    }
    if matches!(window, Some(w) if w.get().is_zero()) {
        return Err(invalid("window", "must be greater than zero"));
    }
    if matches!(duration, Some(BlockDuration::Temporary(d)) if d.is_zero()) {
        return Err(invalid("duration", "must be at least 1s"));
    }
    Ok(())
}

fn default_classifications() -> BTreeMap<String, ClassificationConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "auth-failure".to_string(),
        ClassificationConfig {
            threshold: Some(5),
            window: Some(Interval::from_secs(300)),
            duration: Some(BlockDuration::Temporary(Duration::from_secs(3600))),
            ports: None,
        },
    );
    map.insert(
        "probe".to_string(),
        ClassificationConfig {
            threshold: Some(10),
            window: Some(Interval::from_secs(600)),
            duration: Some(BlockDuration::Temporary(Duration::from_secs(3600))),
            ports: None,
        },
    );
    map.insert(
        "portscan".to_string(),
        ClassificationConfig {
            threshold: Some(3),
            window: Some(Interval::from_secs(60)),
            duration: Some(BlockDuration::Temporary(Duration::from_secs(86400))),
            ports: None,
        },
    );
    map
}

/// A monitored log file and the rule set applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub rule_set: String,
}

fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig {
        path: PathBuf::from("/var/log/auth.log"),
        rule_set: "sshd".to_string(),
    }]
}

/// A rule as written in configuration; compiled by `rules::Rule::compile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub classification: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub ports: Option<PortSpec>,
}

fn default_weight() -> u32 {
    1
}

/// List files. Missing files are treated as empty lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListsConfig {
    pub allow: Vec<PathBuf>,
    pub ignore: Vec<PathBuf>,
    pub deny: Vec<PathBuf>,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            allow: vec![PathBuf::from("/etc/blockwarden/allow.list")],
            ignore: vec![PathBuf::from("/etc/blockwarden/ignore.list")],
            deny: vec![PathBuf::from("/etc/blockwarden/deny.list")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    /// Temporary blocks within `interval` that make the next one permanent
    pub count: u32,
    pub interval: Interval,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 4,
            interval: Interval::from_secs(86400),
        }
    }
}

/// Firewall command templates. Placeholders: `{addr}`, `{ports}`, `{ttl}`.
///
/// Words wrapped in `[...]` are dropped when a placeholder inside is empty,
/// which is how the defaults add a port match only for port-limited blocks.
/// The check command exits 0 when the rule is already present; leave it
/// empty to skip the check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Log intended changes instead of running commands
    pub dry_run: bool,
    pub block_command: String,
    pub unblock_command: String,
    pub check_command: String,
    pub block_command_v6: String,
    pub unblock_command_v6: String,
    pub check_command_v6: String,
    /// Upper bound for a single firewall command
    pub timeout: Interval,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            block_command: iptables_rule("iptables", "-I"),
            unblock_command: iptables_rule("iptables", "-D"),
            check_command: iptables_rule("iptables", "-C"),
            block_command_v6: iptables_rule("ip6tables", "-I"),
            unblock_command_v6: iptables_rule("ip6tables", "-D"),
            check_command_v6: iptables_rule("ip6tables", "-C"),
            timeout: Interval::from_secs(10),
        }
    }
}

fn iptables_rule(program: &str, op: &str) -> String {
    format!(
        "{} {} INPUT -s {{addr}} [-p tcp -m multiport --dports {{ports}}] -j DROP",
        program, op
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlertsConfig {
    pub gotify: GotifyConfig,
    pub webhook: WebhookConfig,
}

impl AlertsConfig {
    pub fn any_enabled(&self) -> bool {
        self.gotify.enabled || self.webhook.enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GotifyConfig {
    pub enabled: bool,
    pub url: String,
    /// Token can be set directly or via BLOCKWARDEN_GOTIFY_TOKEN env var
    /// Memory is securely zeroed when dropped
    pub token: SecureString,
    /// Environment variable name to read token from (optional)
    #[serde(default)]
    pub token_env: Option<String>,
}

impl GotifyConfig {
    /// Get the effective token, checking env var first if configured
    pub fn get_token(&self) -> SecureString {
        if let Some(ref env_name) = self.token_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var("BLOCKWARDEN_GOTIFY_TOKEN") {
            return SecureString::new(val);
        }
        self.token.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if key.contains('\r') || key.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains newline characters",
                key
            )));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header value for '{}': contains newline characters",
                key
            )));
        }
        // RFC 7230 token characters (subset)
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_".contains(c))
        {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}
