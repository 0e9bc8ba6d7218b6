//! Rule engine: compiled patterns that turn a log line into a hit.
//!
//! A [`Rule`] is immutable once compiled. A [`RuleSet`] evaluates its rules
//! in order and the first rule that yields a valid address wins. The
//! [`RuleBook`] holds every rule set the configuration makes available
//! (built-ins from [`crate::presets`], overridden or extended by config).

use regex::Regex;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::{Config, RuleConfig};
use crate::enforcer::PortSpec;
use crate::error::ConfigError;
use crate::presets;
use crate::validation::parse_address;

/// Upper bound on a rule's weight.
pub const MAX_WEIGHT: u32 = 100;

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    regex: Regex,
    pub classification: String,
    pub weight: u32,
    pub ports: Option<PortSpec>,
}

impl Rule {
    /// Compile a configured rule.
    ///
    /// Fails when the pattern is not a valid regex, has no `addr` capture,
    /// or when the weight is outside `1..=100`.
    pub fn compile(rule_set: &str, cfg: &RuleConfig) -> Result<Self, ConfigError> {
        let fail = |reason: String| ConfigError::Rule {
            rule_set: rule_set.to_string(),
            rule: cfg.name.clone(),
            reason,
        };

        if cfg.classification.trim().is_empty() {
            return Err(fail("classification cannot be empty".to_string()));
        }
        if cfg.weight == 0 || cfg.weight > MAX_WEIGHT {
            return Err(fail(format!(
                "weight {} out of range 1..={}",
                cfg.weight, MAX_WEIGHT
            )));
        }

        let regex = Regex::new(&cfg.pattern).map_err(|e| fail(e.to_string()))?;
        if !regex.capture_names().flatten().any(|n| n == "addr") {
            return Err(fail("pattern has no named capture 'addr'".to_string()));
        }

        Ok(Self {
            name: cfg.name.clone(),
            regex,
            classification: cfg.classification.clone(),
            weight: cfg.weight,
            ports: cfg.ports.clone(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// A successful match: who, what, and how much it counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub address: IpAddr,
    pub classification: String,
    pub weight: u32,
    pub ports: Option<PortSpec>,
    pub rule: String,
    pub user: Option<String>,
}

/// Result of applying a rule set to one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched(Hit),
    /// No rule matched; ordinary log noise
    NoMatch,
    /// A rule matched but no matching rule produced a valid address
    Malformed,
}

/// Ordered rules applied to one source.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub name: String,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(name: &str, rules: &[RuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|r| Rule::compile(name, r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            rules,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Apply the rules to a line; the first rule with a valid address wins.
    ///
    /// A rule whose pattern matches but whose `addr` capture is not an IP
    /// literal does not count as a match and evaluation moves on.
    pub fn apply(&self, line: &str) -> RuleOutcome {
        let mut malformed = false;

        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };
            let Some(address) = caps.name("addr").and_then(|m| parse_address(m.as_str())) else {
                malformed = true;
                continue;
            };
            let user = caps
                .name("user")
                .map(|m| m.as_str())
                .filter(|u| !u.is_empty())
                .map(str::to_string);

            return RuleOutcome::Matched(Hit {
                address,
                classification: rule.classification.clone(),
                weight: rule.weight,
                ports: rule.ports.clone(),
                rule: rule.name.clone(),
                user,
            });
        }

        if malformed {
            RuleOutcome::Malformed
        } else {
            RuleOutcome::NoMatch
        }
    }
}

/// Every compiled rule set available to the daemon, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    sets: BTreeMap<String, RuleSet>,
}

impl RuleBook {
    /// Compile built-in and configured rule sets and check that every source
    /// refers to one that exists.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut definitions = presets::default_rule_sets();
        for (name, rules) in &config.rule_sets {
            definitions.insert(name.clone(), rules.clone());
        }

        let mut sets = BTreeMap::new();
        for (name, rules) in &definitions {
            sets.insert(name.clone(), RuleSet::compile(name, rules)?);
        }

        for source in &config.sources {
            if !sets.contains_key(&source.rule_set) {
                return Err(ConfigError::UnknownRuleSet {
                    path: source.path.clone(),
                    rule_set: source.rule_set.clone(),
                });
            }
        }

        Ok(Self { sets })
    }

    pub fn get(&self, name: &str) -> Option<&RuleSet> {
        self.sets.get(name)
    }

    /// Apply the named rule set; an unknown name never matches.
    pub fn apply(&self, rule_set: &str, line: &str) -> RuleOutcome {
        match self.sets.get(rule_set) {
            Some(set) => set.apply(line),
            None => RuleOutcome::NoMatch,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleSet> {
        self.sets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use std::path::PathBuf;

    fn rule(name: &str, pattern: &str, classification: &str) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            pattern: pattern.to_string(),
            classification: classification.to_string(),
            weight: 1,
            ports: None,
        }
    }

    fn builtins() -> RuleBook {
        RuleBook::from_config(&Config::default()).unwrap()
    }

    fn hit(outcome: RuleOutcome) -> Hit {
        match outcome {
            RuleOutcome::Matched(h) => h,
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_requires_addr_group() {
        let err = Rule::compile("x", &rule("r", r"from (?P<ip>\S+)", "probe")).unwrap_err();
        assert!(err.to_string().contains("addr"));
    }

    #[test]
    fn test_compile_rejects_bad_regex() {
        assert!(Rule::compile("x", &rule("r", r"(?P<addr>[", "probe")).is_err());
    }

    #[test]
    fn test_compile_rejects_weight_out_of_range() {
        let mut cfg = rule("r", r"(?P<addr>\S+)", "probe");
        cfg.weight = 0;
        assert!(Rule::compile("x", &cfg).is_err());
        cfg.weight = MAX_WEIGHT + 1;
        assert!(Rule::compile("x", &cfg).is_err());
        cfg.weight = MAX_WEIGHT;
        assert!(Rule::compile("x", &cfg).is_ok());
    }

    #[test]
    fn test_first_listed_rule_wins() {
        let set = RuleSet::compile(
            "t",
            &[
                rule("specific", r"Failed password .* from (?P<addr>\S+)", "auth-failure"),
                rule("general", r"from (?P<addr>\S+)", "probe"),
            ],
        )
        .unwrap();
        let h = hit(set.apply("Failed password for root from 192.0.2.1 port 22"));
        assert_eq!(h.rule, "specific");
        assert_eq!(h.classification, "auth-failure");
    }

    #[test]
    fn test_invalid_address_falls_through_to_next_rule() {
        let set = RuleSet::compile(
            "t",
            &[
                rule("loose", r"from (?P<addr>\S+)", "probe"),
                rule("rhost", r"rhost=(?P<addr>\S+)", "auth-failure"),
            ],
        )
        .unwrap();
        let h = hit(set.apply("login from unknown rhost=192.0.2.1"));
        assert_eq!(h.rule, "rhost");
        assert_eq!(h.address.to_string(), "192.0.2.1");
    }

    #[test]
    fn test_invalid_address_without_fallback_is_malformed() {
        let set = RuleSet::compile("t", &[rule("loose", r"from (?P<addr>\S+)", "probe")]).unwrap();
        assert_eq!(set.apply("from 300.1.2.3"), RuleOutcome::Malformed);
        assert_eq!(set.apply("from 1.2.3"), RuleOutcome::Malformed);
        assert_eq!(set.apply("nothing here"), RuleOutcome::NoMatch);
    }

    #[test]
    fn test_unknown_rule_set_reported_with_source() {
        let config = Config {
            sources: vec![SourceConfig {
                path: PathBuf::from("/var/log/custom.log"),
                rule_set: "custom".to_string(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            RuleBook::from_config(&config),
            Err(ConfigError::UnknownRuleSet { .. })
        ));
    }

    #[test]
    fn test_config_overrides_builtin_by_name() {
        let mut config = Config::default();
        config.rule_sets.insert(
            "sshd".to_string(),
            vec![rule("only", r"BAD (?P<addr>\S+)", "auth-failure")],
        );
        let book = RuleBook::from_config(&config).unwrap();
        assert_eq!(book.get("sshd").unwrap().rules().len(), 1);
        assert_eq!(
            book.apply(
                "sshd",
                "sshd[1]: Failed password for root from 192.0.2.1 port 22 ssh2"
            ),
            RuleOutcome::NoMatch
        );
        assert!(matches!(
            book.apply("sshd", "BAD 192.0.2.1"),
            RuleOutcome::Matched(_)
        ));
    }

    #[test]
    fn test_unknown_set_never_matches() {
        assert_eq!(builtins().apply("nope", "from 1.2.3.4"), RuleOutcome::NoMatch);
    }

    #[test]
    fn test_sshd_failed_password_invalid_user() {
        let h = hit(builtins().apply(
            "sshd",
            "Oct 19 10:00:01 host sshd[1234]: Failed password for invalid user admin from 203.0.113.7 port 52211 ssh2",
        ));
        assert_eq!(h.address.to_string(), "203.0.113.7");
        assert_eq!(h.classification, "auth-failure");
        assert_eq!(h.user.as_deref(), Some("admin"));
        assert_eq!(h.rule, "sshd-failed-password");
    }

    #[test]
    fn test_sshd_ipv6() {
        let h = hit(builtins().apply(
            "sshd",
            "sshd[1234]: Failed password for root from 2001:db8::5 port 52211 ssh2",
        ));
        assert_eq!(h.address.to_string(), "2001:db8::5");
        assert_eq!(h.user.as_deref(), Some("root"));
    }

    #[test]
    fn test_sshd_pam_failure() {
        let h = hit(builtins().apply(
            "sshd",
            "sshd[77]: pam_unix(sshd:auth): authentication failure; logname= uid=0 euid=0 tty=ssh ruser= rhost=192.0.2.44  user=root",
        ));
        assert_eq!(h.rule, "sshd-pam-failure");
        assert_eq!(h.address.to_string(), "192.0.2.44");
        assert_eq!(h.user.as_deref(), Some("root"));
    }

    #[test]
    fn test_sshd_probe_classification() {
        let h = hit(builtins().apply(
            "sshd",
            "sshd[55]: Did not receive identification string from 192.0.2.9 port 1234",
        ));
        assert_eq!(h.classification, "probe");
        assert!(h.user.is_none());
    }

    #[test]
    fn test_sshd_bad_address_is_malformed() {
        assert_eq!(
            builtins().apply(
                "sshd",
                "sshd[1]: Failed password for root from 999.1.1.1 port 22 ssh2"
            ),
            RuleOutcome::Malformed
        );
    }

    #[test]
    fn test_vsftpd_mapped_address_normalised() {
        let h = hit(builtins().apply(
            "ftp",
            r#"vsftpd[12]: [ftp] FAIL LOGIN: Client "::ffff:192.0.2.77""#,
        ));
        assert_eq!(h.address.to_string(), "192.0.2.77");
        assert!(h.address.is_ipv4());
        assert_eq!(h.ports.unwrap().to_string(), "20,21");
    }

    #[test]
    fn test_postfix_sasl() {
        let h = hit(builtins().apply(
            "mail",
            "postfix/smtpd[3321]: warning: unknown[203.0.113.50]: SASL LOGIN authentication failed: UGFzc3dvcmQ6",
        ));
        assert_eq!(h.address.to_string(), "203.0.113.50");
        assert_eq!(h.rule, "postfix-sasl");
    }

    #[test]
    fn test_modsecurity_with_client_port() {
        let h = hit(builtins().apply(
            "web",
            "[Sun Oct 19 10:00:00.123 2026] [security2:error] [pid 1:tid 2] [client 198.51.100.4:51234] ModSecurity: Access denied with code 403",
        ));
        assert_eq!(h.address.to_string(), "198.51.100.4");
        assert_eq!(h.classification, "probe");
    }

    #[test]
    fn test_web_exploit_probe() {
        let h = hit(builtins().apply(
            "web",
            r#"203.0.113.9 - - [19/Oct/2026:10:00:00 +0000] "GET /wp-login.php HTTP/1.1" 404 123"#,
        ));
        assert_eq!(h.rule, "web-exploit-probe");
        assert_eq!(
            builtins().apply(
                "web",
                r#"203.0.113.9 - - [19/Oct/2026:10:00:00 +0000] "GET /index.html HTTP/1.1" 200 512"#
            ),
            RuleOutcome::NoMatch
        );
    }

    #[test]
    fn test_kernel_portscan() {
        let h = hit(builtins().apply(
            "portscan",
            "kernel: [12345.678] DROP IN=eth0 OUT= MAC=aa:bb SRC=192.0.2.200 DST=10.0.0.1 LEN=44 PROTO=TCP SPT=5555 DPT=23 WINDOW=1024",
        ));
        assert_eq!(h.address.to_string(), "192.0.2.200");
        assert_eq!(h.classification, "portscan");
    }
}
