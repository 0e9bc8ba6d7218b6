//! Daemon command implementation.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{AlertDispatcher, AlertManager, NullDispatcher};
use crate::dispatcher::Dispatcher;
use crate::enforcer::{check_root, CommandApplier, DryRunApplier, FirewallApplier};
use crate::lock::LockGuard;
use crate::signal::{spawn_listener, ReloadToken, ShutdownToken};

/// Run the daemon until SIGINT or SIGTERM
pub async fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;

    if !config.firewall.dry_run {
        check_root()?;
    }

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            config.state_dir.display()
        )
    })?;
    let _instance = LockGuard::acquire_instance(&config.state_dir)?;

    let applier: Arc<dyn FirewallApplier> = if config.firewall.dry_run {
        info!("Firewall dry-run mode: no rules will be changed");
        Arc::new(DryRunApplier)
    } else {
        Arc::new(CommandApplier::new(&config.firewall))
    };

    let alerts: Arc<dyn AlertDispatcher> = if config.alerts.any_enabled() {
        match AlertManager::new(config.alerts.clone()) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                warn!("Alerts disabled, failed to build HTTP client: {}", e);
                Arc::new(NullDispatcher)
            }
        }
    } else {
        Arc::new(NullDispatcher)
    };

    let dispatcher = Dispatcher::new(config, config_path, applier, alerts)
        .context("Failed to start daemon")?;

    let shutdown = ShutdownToken::new();
    let reload = ReloadToken::new();
    let listener = spawn_listener(shutdown.clone(), reload.clone());

    let engine = tokio::spawn(dispatcher.run(shutdown, reload));
    let counters = engine
        .await
        .context("Daemon task terminated abnormally")?;
    listener.abort();

    info!("Daemon stopped ({})", counters);
    Ok(())
}
