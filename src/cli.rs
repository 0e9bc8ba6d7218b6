//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "blockwarden")]
#[command(author, version, about = "Log-driven intrusion detection and firewall blocking")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the configured logs and block offenders
    Daemon,

    /// Manage blocks by hand
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },

    /// Show how an address is treated (lists and active blocks)
    Check {
        /// IP address to check
        ip: String,
    },

    /// Inspect and test rule sets
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Show current status
    Status,

    /// Show version
    Version,
}

#[derive(Subcommand)]
pub enum BlockAction {
    /// Block an IP or CIDR
    Add {
        /// IP or CIDR to block
        target: String,
        /// Block duration (30s, 5m, 1h, 1d); permanent when omitted
        #[arg(long)]
        ttl: Option<String>,
        /// Ports to block (22,80,1000-2000); all ports when omitted
        #[arg(long)]
        ports: Option<String>,
        /// Reason recorded with the block
        #[arg(long, default_value = "manual block")]
        reason: String,
    },
    /// Remove a block
    Del {
        /// IP or CIDR to unblock
        target: String,
    },
    /// List active blocks
    List,
    /// Remove every temporary block
    Flush,
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rule sets and their rules
    List,
    /// Run a rule set over a sample log file and report matches
    Test {
        /// Rule set name
        rule_set: String,
        /// Log file to read
        file: PathBuf,
    },
}
