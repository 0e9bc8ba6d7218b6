//! blockwarden - log-driven intrusion detection and firewall blocking.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use blockwarden::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // journald adds its own timestamps
    let under_systemd = std::env::var_os("INVOCATION_ID").is_some();
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false);
    if under_systemd || !matches!(cli.command, Commands::Daemon) {
        tracing::subscriber::set_global_default(builder.without_time().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    // Execute command
    match cli.command {
        Commands::Daemon => blockwarden::commands::daemon::run(&cli.config).await,
        Commands::Block { action } => blockwarden::commands::block::run(action, &cli.config).await,
        Commands::Check { ip } => blockwarden::commands::check::run(&ip, &cli.config).await,
        Commands::Rules { action } => blockwarden::commands::rules::run(action, &cli.config).await,
        Commands::Status => blockwarden::commands::status::run(&cli.config).await,
        Commands::Version => {
            println!("blockwarden {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
