//! Check command implementation.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;

use crate::config::Config;
use crate::lists::{ListDecision, ListSnapshot};
use crate::store::StateStore;
use crate::utils::format_remaining;
use crate::validation::validate_ip;

/// Run the check command
pub async fn run(ip_str: &str, config_path: &Path) -> Result<()> {
    let ip = validate_ip(ip_str)?;

    // Load config
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let lists = ListSnapshot::load(&config.lists);
    let (decision, entry) = lists.lookup(ip);

    println!();
    match entry {
        Some(entry) => println!(
            "IP {} is {}-listed by {} ({}){}",
            ip,
            decision,
            entry.network,
            entry.source_file.display(),
            entry
                .comment
                .as_deref()
                .map(|c| format!(": {}", c))
                .unwrap_or_default()
        ),
        None => println!("IP {} list decision: {}", ip, decision),
    }

    let state = StateStore::from_config(&config).load()?;
    match state.covering(ip) {
        Some(block) => {
            let expires = match block.expires_at {
                Some(at) => format!("expires in {}", format_remaining(at - Utc::now())),
                None => "permanent".to_string(),
            };
            println!("IP {} is BLOCKED by {} ({})", ip, block.target, expires);
            println!("Reason: {}", block.reason);
        }
        None => match decision {
            ListDecision::Deny => println!("IP {} is BLOCKED by the deny list", ip),
            ListDecision::Allow | ListDecision::Ignore => {
                println!("IP {} is NOT blocked and is exempt from blocking", ip)
            }
            ListDecision::Unlisted => println!("IP {} is NOT blocked", ip),
        },
    }
    println!();

    Ok(())
}
