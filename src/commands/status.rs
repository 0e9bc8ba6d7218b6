//! Status command implementation.

use anyhow::Result;
use std::path::Path;

use crate::lists::ListSnapshot;
use crate::lock::running_daemon;
use crate::store::{Origin, StateStore};
use crate::utils::format_bytes;

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;

    println!();
    match running_daemon(&config.state_dir) {
        Some(0) => println!("Daemon: RUNNING"),
        Some(pid) => println!("Daemon: RUNNING (pid {})", pid),
        None => println!("Daemon: STOPPED"),
    }
    println!(
        "Firewall: {}",
        if config.firewall.dry_run {
            "dry-run"
        } else {
            "enforcing"
        }
    );
    println!(
        "Blocking: {}",
        if config.blocking_enabled {
            "enabled"
        } else {
            "disabled (detection only)"
        }
    );
    println!(
        "Alerts: {}",
        if config.alerts_enabled && config.alerts.any_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "Polling: every {}, up to {} per source",
        config.poll_interval,
        format_bytes(config.read_budget)
    );
    println!();

    let store = StateStore::from_config(&config);
    match store.load() {
        Ok(state) => {
            let permanent = state.blocks.iter().filter(|e| e.is_permanent()).count();
            let manual = state
                .blocks
                .iter()
                .filter(|e| e.origin == Origin::Manual)
                .count();
            println!(
                "Blocks: {} ({} daemon, {} manual, {} permanent)",
                state.blocks.len(),
                state.daemon_count(),
                manual,
                permanent
            );
            if let Some(updated) = state.updated_at {
                let local: chrono::DateTime<chrono::Local> = updated.into();
                println!("Last change: {}", local.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        Err(e) => println!("Blocks: unavailable ({})", e),
    }

    let (allow, ignore, deny) = ListSnapshot::load(&config.lists).counts();
    println!(
        "Lists: {} allow, {} ignore, {} deny entries",
        allow, ignore, deny
    );
    println!();

    println!("Sources:");
    for source in &config.sources {
        let state = if std::fs::File::open(&source.path).is_ok() {
            "ok"
        } else {
            "unreadable"
        };
        println!(
            "  {:<32} {:<12} {}",
            source.path.display(),
            source.rule_set,
            state
        );
    }
    println!();

    Ok(())
}
