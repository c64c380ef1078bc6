//! Cluster installer CLI.
//!
//! Installs a Kubernetes cluster and its platform modules into the region
//! directory it is run from.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cluster_installer::commands::install::InstallCommand;
use cluster_installer::ui;

/// Cluster installer - resumable Kubernetes cluster bootstrapper.
#[derive(Parser)]
#[command(
    name = "cluster-installer",
    version,
    about = "Resumable Kubernetes cluster installer",
    long_about = "Install a Kubernetes cluster and its platform modules.\n\n\
                  Run from a region directory. Every stage is checked against the\n\
                  status of its modules, so re-running the same command after a\n\
                  failure or interruption resumes where it left off."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster lifecycle commands.
    #[command(subcommand)]
    Cluster(ClusterCommands),
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Install a new cluster, or resume an interrupted installation.
    Install(InstallCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,cluster_installer=debug")
        } else {
            EnvFilter::new("warn,cluster_installer=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            ui::print_warning("Interrupted. Finishing the current step; re-run to resume.");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Cluster(ClusterCommands::Install(cmd)) => cmd.run(cancel).await,
    }
}
