//! Manual block management.
//!
//! Changes go to the firewall right away, whether or not a daemon runs. The
//! daemon picks up the store change on its next cycle; without one, expiry of
//! temporary blocks waits until it starts.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use crate::alerts::NullDispatcher;
use crate::blocks::BlockManager;
use crate::cli::BlockAction;
use crate::config::{Config, Settings};
use crate::enforcer::{check_root, CommandApplier, DryRunApplier, FirewallApplier, PortSpec};
use crate::lists::ListSnapshot;
use crate::lock::running_daemon;
use crate::store::{BlockEntry, StateStore};
use crate::utils::{format_remaining, truncate};
use crate::validation::{parse_interval, validate_ip_or_cidr};

/// Run the block command
pub async fn run(action: BlockAction, config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    match action {
        BlockAction::Add {
            target,
            ttl,
            ports,
            reason,
        } => add_block(&config, &target, ttl.as_deref(), ports.as_deref(), &reason).await,
        BlockAction::Del { target } => remove_block(&config, &target).await,
        BlockAction::List => list_blocks(&config),
        BlockAction::Flush => flush_blocks(&config).await,
    }
}

/// Block manager for an administrative command.
fn manager(config: &Config) -> Result<BlockManager> {
    let applier: Arc<dyn FirewallApplier> = if config.firewall.dry_run {
        Arc::new(DryRunApplier)
    } else {
        check_root()?;
        Arc::new(CommandApplier::new(&config.firewall))
    };

    let store = StateStore::from_config(config);
    let denied = store.load().context("Failed to read block state")?.denied;
    let settings: Arc<dyn Settings> = Arc::new(config.clone());
    let mut manager = BlockManager::new(applier, Arc::new(NullDispatcher), settings, store);
    manager.assume_deny_enforced(denied);
    Ok(manager)
}

fn notice_if_no_daemon(config: &Config, entry: &BlockEntry) {
    if !entry.is_permanent() && running_daemon(&config.state_dir).is_none() {
        println!("     Daemon not running; expiry is enforced once it starts");
    }
}

/// Block an IP/CIDR
async fn add_block(
    config: &Config,
    target: &str,
    ttl: Option<&str>,
    ports: Option<&str>,
    reason: &str,
) -> Result<()> {
    let target = validate_ip_or_cidr(target)?;
    let duration = ttl.map(parse_interval).transpose()?;
    let ports = ports
        .map(|p| p.parse::<PortSpec>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid ports: {}", e))?;

    let lists = ListSnapshot::load(&config.lists);
    if lists.protects(&target) {
        anyhow::bail!(
            "{} overlaps the allow or ignore list and cannot be blocked",
            target
        );
    }

    let mut manager = manager(config)?;
    let entry = manager
        .block_manual(target, duration, ports, reason, Utc::now())
        .await
        .with_context(|| format!("Failed to block {}", target))?;

    println!("[OK] Blocked {} ({})", entry.target, describe_expiry(&entry));
    notice_if_no_daemon(config, &entry);
    Ok(())
}

/// Remove a block
async fn remove_block(config: &Config, target: &str) -> Result<()> {
    let target = validate_ip_or_cidr(target)?;
    let mut manager = manager(config)?;

    match manager
        .unblock_manual(target)
        .await
        .with_context(|| format!("Failed to unblock {}", target))?
    {
        Some(entry) => {
            println!("[OK] Unblocked {} ({})", entry.target, entry.reason);
            Ok(())
        }
        None => {
            println!("{} is not blocked", target);
            Ok(())
        }
    }
}

/// List active blocks
fn list_blocks(config: &Config) -> Result<()> {
    let state = StateStore::from_config(config).load()?;
    let now = Utc::now();

    let mut blocks: Vec<&BlockEntry> = state.blocks.iter().collect();
    blocks.sort_by_key(|e| e.created_at);

    println!();
    if blocks.is_empty() {
        println!("No active blocks.");
        println!();
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<14} {:<10} {:<12} {}",
        "TARGET", "ORIGIN", "CLASS", "EXPIRES", "PORTS", "REASON"
    );
    println!("{}", "-".repeat(80));
    for entry in &blocks {
        let expires = match entry.expires_at {
            Some(at) => format_remaining(at - now),
            None => "never".to_string(),
        };
        let ports = entry
            .ports
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "all".to_string());
        println!(
            "{:<20} {:<8} {:<14} {:<10} {:<12} {}",
            entry.target.to_string(),
            entry.origin.to_string(),
            truncate(&entry.classification, 14),
            expires,
            truncate(&ports, 12),
            entry.reason
        );
    }
    println!();
    println!("Total: {} blocks", blocks.len());
    println!();

    Ok(())
}

/// Remove every temporary block
async fn flush_blocks(config: &Config) -> Result<()> {
    let mut manager = manager(config)?;
    let removed = manager
        .flush_temporary()
        .await
        .context("Failed to flush temporary blocks")?;

    println!("[OK] Removed {} temporary blocks", removed);
    Ok(())
}

fn describe_expiry(entry: &BlockEntry) -> String {
    match entry.expires_at {
        Some(at) => format!("expires in {}", format_remaining(at - entry.created_at)),
        None => "permanent".to_string(),
    }
}
