use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::apply::TerragruntEngine;
use crate::checkpoint::CheckpointStore;
use crate::config::{PollSettings, CHECKPOINT_FILE};
use crate::context::InstallContext;
use crate::identity::AwsCli;
use crate::orchestrator::Installer;
use crate::preflight::{self, PrerequisitesValidator};
use crate::probe::LiveProbe;
use crate::prompt::TerminalPrompter;
use crate::proxy::KubectlProxyLauncher;
use crate::secrets::SopsStore;
use crate::ui;
use crate::vault::{KubectlVault, RecoveryScheme};

/// Install a cluster into the current region directory
#[derive(Args, Debug)]
pub struct InstallCommand {
    /// Region directory to install (defaults to the current directory)
    #[arg(short, long, value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Number of Vault recovery shares to generate
    #[arg(long, env = "INSTALLER_RECOVERY_SHARES", default_value_t = 1)]
    recovery_shares: u8,

    /// Number of recovery shares required to unseal Vault
    #[arg(long, env = "INSTALLER_RECOVERY_THRESHOLD", default_value_t = 1)]
    recovery_threshold: u8,

    /// Checkpoint file (defaults to .install-checkpoint.json in the region directory)
    #[arg(long, value_name = "FILE")]
    checkpoint_file: Option<PathBuf>,

    /// Accept the default answer of yes/no prompts
    #[arg(short, long)]
    yes: bool,
}

impl InstallCommand {
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        ui::print_banner();

        ui::print_section("Checking prerequisites");
        PrerequisitesValidator::new().validate()?;
        let recovery = RecoveryScheme {
            shares: self.recovery_shares,
            threshold: self.recovery_threshold,
        }
        .validate()?;

        ui::print_section("Resolving the installation target");
        let directory = match &self.directory {
            Some(directory) => directory.clone(),
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };
        let prompter = Arc::new(TerminalPrompter::new(self.yes));
        let target = preflight::resolve_target(&directory, prompter.as_ref())?;
        ui::print_kv("Environment", &target.environment);
        ui::print_kv("Region", &target.region);
        ui::print_kv("SLA target", &target.sla_target.to_string());
        ui::print_kv("Cluster domain", &target.kube_domain);

        let checkpoint_path = self
            .checkpoint_file
            .clone()
            .unwrap_or_else(|| target.region_dir.join(CHECKPOINT_FILE));
        info!(checkpoint = %checkpoint_path.display(), "Using checkpoint file");

        let polls = PollSettings::default();
        let ctx = InstallContext {
            apply: Arc::new(TerragruntEngine::new()),
            proxies: Arc::new(KubectlProxyLauncher::new(polls.proxy_ready)),
            vault: Arc::new(KubectlVault::new(target.kube_context())),
            secrets: Arc::new(SopsStore::new()),
            identity: Arc::new(AwsCli::new()),
            probe: Arc::new(LiveProbe::new(Some(target.kube_context()))),
            prompter,
            checkpoint: CheckpointStore::new(checkpoint_path),
            polls,
            recovery,
            cancel,
            target,
        };

        Installer::new(ctx).run_to_completion().await?;
        Ok(())
    }
}
