//! # blockwarden - log-driven intrusion detection for Linux hosts
//!
//! Watches authentication and service logs, counts failures per source
//! address and classification within a sliding window, and blocks offenders
//! at the host firewall for a configurable time. Blocks survive restarts,
//! expire on schedule and can be managed from the command line.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        blockwarden                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: daemon, block, check, rules, status        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── Policies per classification, sources, rule sets      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Dispatcher (tokio)                                         │
//! │    ├── Reader: incremental tailing with rotation handling   │
//! │    ├── Rules: regex matching with an `addr` capture         │
//! │    ├── Ledger: sliding-window failure counts                │
//! │    └── Lists: allow / ignore / deny files                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Blocks                                                     │
//! │    ├── Store: JSON state file, atomic writes, file lock     │
//! │    ├── Enforcer: FirewallApplier (command templates)        │
//! │    └── Alerts: Gotify and webhook (reqwest + rustls)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use blockwarden::alerts::NullDispatcher;
//! use blockwarden::config::Config;
//! use blockwarden::dispatcher::Dispatcher;
//! use blockwarden::enforcer::DryRunApplier;
//! use blockwarden::signal::{ReloadToken, ShutdownToken};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/blockwarden/config.yaml")?;
//!     let dispatcher = Dispatcher::new(
//!         config,
//!         "/etc/blockwarden/config.yaml",
//!         Arc::new(DryRunApplier),
//!         Arc::new(NullDispatcher),
//!     )?;
//!     dispatcher.run(ShutdownToken::new(), ReloadToken::new()).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`alerts`] - Block notifications (Gotify, Webhook)
//! - [`blocks`] - Block lifecycle: trigger, refresh, expiry, manual changes
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`dispatcher`] - The daemon loop
//! - [`dnsbl`] - DNS blocklist lookup seam for alerts
//! - [`enforcer`] - Firewall applier abstraction
//! - [`error`] - Typed error kinds
//! - [`ledger`] - Sliding-window failure counting
//! - [`lists`] - Allow, ignore and deny list files
//! - [`lock`] - Instance and state file locking
//! - [`presets`] - Built-in rule sets
//! - [`reader`] - Incremental log reading
//! - [`rules`] - Rule compilation and matching
//! - [`signal`] - Shutdown and reload signal handling
//! - [`sources`] - Configured log sources
//! - [`store`] - Persistent block state
//! - [`utils`] - Formatting helpers
//! - [`validation`] - Address and interval parsing

pub mod alerts;
pub mod blocks;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod dnsbl;
pub mod enforcer;
pub mod error;
pub mod ledger;
pub mod lists;
pub mod lock;
pub mod presets;
pub mod reader;
pub mod rules;
pub mod signal;
pub mod sources;
pub mod store;
pub mod utils;
pub mod validation;

pub use cli::{BlockAction, Cli, Commands, RulesAction};
pub use config::Config;
