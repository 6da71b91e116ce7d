//! SecureChat CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use securechat_cli::{cli::Cli, commands::CommandDispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    CommandDispatcher::execute(cli)
        .await
        .context("Command execution failed")?;

    info!("SecureChat CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
