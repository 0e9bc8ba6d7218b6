//! Built-in rule sets.
//!
//! These cover the services a typical host exposes. A rule set in the
//! configuration file with the same name replaces the built-in one entirely;
//! any other name adds a new set.
//!
//! Within a set, rules are tried in order and the first match wins, so more
//! specific patterns are listed before general ones.

use std::collections::BTreeMap;

use crate::config::RuleConfig;
use crate::enforcer::PortSpec;

/// Classification for failed logins.
pub const AUTH_FAILURE: &str = "auth-failure";
/// Classification for reconnaissance and exploit attempts.
pub const PROBE: &str = "probe";
/// Classification for packet-filter log lines showing scan traffic.
pub const PORTSCAN: &str = "portscan";

struct BuiltinRule {
    name: &'static str,
    pattern: &'static str,
    classification: &'static str,
    weight: u32,
}

const SSHD: &[BuiltinRule] = &[
    BuiltinRule {
        name: "sshd-failed-password",
        pattern: r"sshd\[\d+\]: Failed (?:password|publickey|keyboard-interactive/pam|none) for (?:invalid user )?(?P<user>\S*) from (?P<addr>\S+) port \d+",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "sshd-max-attempts",
        pattern: r"sshd\[\d+\]: error: maximum authentication attempts exceeded for (?:invalid user )?(?P<user>\S*) from (?P<addr>\S+) port \d+",
        classification: AUTH_FAILURE,
        weight: 2,
    },
    BuiltinRule {
        name: "sshd-invalid-user",
        pattern: r"sshd\[\d+\]: Invalid user (?P<user>\S*) from (?P<addr>\S+)",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "sshd-pam-failure",
        pattern: r"sshd\[\d+\]: pam_unix\(sshd:auth\): authentication failure;.* rhost=(?P<addr>\S+)(?:\s+user=(?P<user>\S+))?",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "sshd-no-identification",
        pattern: r"sshd\[\d+\]: Did not receive identification string from (?P<addr>\S+)",
        classification: PROBE,
        weight: 1,
    },
    BuiltinRule {
        name: "sshd-negotiation",
        pattern: r"sshd\[\d+\]: Unable to negotiate with (?P<addr>\S+) port \d+: no matching",
        classification: PROBE,
        weight: 1,
    },
];

const FTP: &[BuiltinRule] = &[
    BuiltinRule {
        name: "vsftpd-fail-login",
        pattern: r#"vsftpd(?:\[\d+\])?: .*FAIL LOGIN: Client "(?P<addr>[^"]+)""#,
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "pure-ftpd-auth",
        pattern: r"pure-ftpd(?:\[\d+\])?: \((?:\?|\S+)@(?P<addr>[^)]+)\) \[WARNING\] Authentication failed for user \[(?P<user>[^\]]*)\]",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "proftpd-login",
        pattern: r"proftpd\[\d+\]: \S+ \(\S*\[(?P<addr>[^\]]+)\]\) - USER (?P<user>\S+)(?::| \(Login failed\))",
        classification: AUTH_FAILURE,
        weight: 1,
    },
];

const MAIL: &[BuiltinRule] = &[
    BuiltinRule {
        name: "postfix-sasl",
        pattern: r"postfix/(?:submission/|smtps/)?smtpd\[\d+\]: warning: \S+\[(?P<addr>[^\]]+)\]: SASL \S+ authentication failed",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "dovecot-auth",
        pattern: r"dovecot(?:\[\d+\])?: (?:imap|pop3|submission)-login: (?:Disconnected|Aborted login)[^:]*\(auth failed[^)]*\):.* user=<(?P<user>[^>]*)>.* rip=(?P<addr>[^,\s]+)",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "postfix-rbl-reject",
        pattern: r"postfix/smtpd\[\d+\]: NOQUEUE: reject: RCPT from \S+\[(?P<addr>[^\]]+)\]: 554 5\.7\.1 Service unavailable; Client host",
        classification: PROBE,
        weight: 1,
    },
];

const WEB: &[BuiltinRule] = &[
    BuiltinRule {
        name: "modsecurity-denied",
        pattern: r"\[client (?P<addr>[0-9a-fA-F.:]+?)(?::\d+)?\] ModSecurity: Access denied",
        classification: PROBE,
        weight: 1,
    },
    BuiltinRule {
        name: "apache-auth",
        pattern: r"\[client (?P<addr>[0-9a-fA-F.:]+?)(?::\d+)?\] (?:AH01617: )?user (?P<user>\S+): authentication failure",
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "nginx-auth",
        pattern: r#"user "(?P<user>[^"]*)"(?: was not found in| password mismatch).*client: (?P<addr>[0-9a-fA-F.:]+)"#,
        classification: AUTH_FAILURE,
        weight: 1,
    },
    BuiltinRule {
        name: "web-exploit-probe",
        pattern: r#"^(?P<addr>[0-9a-fA-F.:]+) \S+ \S+ \[[^\]]+\] "(?:GET|POST|HEAD) /(?:\S*/)?(?:wp-login\.php|xmlrpc\.php|\.env|\.git/|phpmyadmin|cgi-bin/\S*\.sh)"#,
        classification: PROBE,
        weight: 1,
    },
];

const PORTSCAN_RULES: &[BuiltinRule] = &[BuiltinRule {
    name: "kernel-drop",
    pattern: r"kernel: .*IN=\S+ .*SRC=(?P<addr>[0-9a-fA-F.:]+) .*PROTO=(?:TCP|UDP) .*DPT=\d+",
    classification: PORTSCAN,
    weight: 1,
}];

fn builtin(rules: &[BuiltinRule], ports: Option<&str>) -> Vec<RuleConfig> {
    let ports: Option<PortSpec> = ports.and_then(|p| p.parse().ok());
    rules
        .iter()
        .map(|r| RuleConfig {
            name: r.name.to_string(),
            pattern: r.pattern.to_string(),
            classification: r.classification.to_string(),
            weight: r.weight,
            ports: ports.clone(),
        })
        .collect()
}

/// All built-in rule sets, keyed by name.
pub fn default_rule_sets() -> BTreeMap<String, Vec<RuleConfig>> {
    let mut sets = BTreeMap::new();
    sets.insert("sshd".to_string(), builtin(SSHD, None));
    sets.insert("ftp".to_string(), builtin(FTP, Some("20,21")));
    sets.insert(
        "mail".to_string(),
        builtin(MAIL, Some("25,110,143,465,587,993,995")),
    );
    sets.insert("web".to_string(), builtin(WEB, Some("80,443")));
    sets.insert("portscan".to_string(), builtin(PORTSCAN_RULES, None));
    sets
}

/// Names of the built-in rule sets.
pub fn builtin_names() -> Vec<&'static str> {
    vec!["ftp", "mail", "portscan", "sshd", "web"]
}
