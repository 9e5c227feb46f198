//! # lvlt
//!
//! Entry point of the lvlt command-line shell.

use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lvlt::cli::{self, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lvlt=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli).await {
        eprintln!(
            "{} {}\n{}",
            "Error:".red().bold(),
            format!("{:#}", e).red(),
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
}
