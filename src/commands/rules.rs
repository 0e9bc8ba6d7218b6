//! Rule set inspection and testing.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::cli::RulesAction;
use crate::config::Config;
use crate::presets;
use crate::rules::{RuleBook, RuleOutcome, RuleSet};
use crate::utils::{format_count_with_separator, truncate};

/// Matches shown in `rules test` output.
const SHOWN_MATCHES: usize = 10;

/// Run the rules command
pub async fn run(action: RulesAction, config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };
    let book = RuleBook::from_config(&config)?;

    match action {
        RulesAction::List => {
            list_rules(&book, &config);
            Ok(())
        }
        RulesAction::Test { rule_set, file } => test_rules(&book, &rule_set, &file),
    }
}

fn list_rules(book: &RuleBook, config: &Config) {
    let builtin = presets::builtin_names();
    println!();
    for set in book.iter() {
        let origin =
            if builtin.contains(&set.name.as_str()) && !config.rule_sets.contains_key(&set.name) {
                "built-in"
            } else {
                "configured"
            };
        println!("{} ({} rules, {})", set.name, set.rules().len(), origin);
        for rule in set.rules() {
            let ports = rule
                .ports
                .as_ref()
                .map(|p| format!(" ports={}", p))
                .unwrap_or_default();
            println!(
                "  - {:<24} {:<14} weight={}{}",
                rule.name, rule.classification, rule.weight, ports
            );
            println!("      {}", truncate(rule.pattern(), 100));
        }
        println!();
    }
}

/// Tally of a rule set run over a file.
#[derive(Debug, Default, PartialEq, Eq)]
struct TestReport {
    lines: u64,
    malformed: u64,
    /// Matches per rule name
    per_rule: BTreeMap<String, u64>,
    shown: Vec<String>,
}

impl TestReport {
    fn matched(&self) -> u64 {
        self.per_rule.values().sum()
    }
}

fn evaluate(set: &RuleSet, content: &str) -> TestReport {
    let mut report = TestReport::default();
    for line in content.lines() {
        report.lines += 1;
        match set.apply(line) {
            RuleOutcome::Matched(hit) => {
                *report.per_rule.entry(hit.rule.clone()).or_default() += 1;
                if report.shown.len() < SHOWN_MATCHES {
                    report.shown.push(format!(
                        "{} {} [{}]",
                        hit.address, hit.classification, hit.rule
                    ));
                }
            }
            RuleOutcome::Malformed => report.malformed += 1,
            RuleOutcome::NoMatch => {}
        }
    }
    report
}

fn test_rules(book: &RuleBook, rule_set: &str, file: &Path) -> Result<()> {
    let set = book.get(rule_set).ok_or_else(|| {
        let names: Vec<&str> = book.iter().map(|s| s.name.as_str()).collect();
        anyhow::anyhow!(
            "Unknown rule set '{}'. Available: {}",
            rule_set,
            names.join(", ")
        )
    })?;

    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let report = evaluate(set, &String::from_utf8_lossy(&bytes));

    println!();
    println!("Rule set:  {}", set.name);
    println!("Lines:     {}", format_count_with_separator(report.lines));
    println!("Matched:   {}", format_count_with_separator(report.matched()));
    println!("Malformed: {}", format_count_with_separator(report.malformed));
    if !report.per_rule.is_empty() {
        println!();
        for (rule, count) in &report.per_rule {
            println!("  {:<24} {}", rule, format_count_with_separator(*count));
        }
        println!();
        for line in &report.shown {
            println!("  {}", line);
        }
    }
    println!();

    Ok(())
}
