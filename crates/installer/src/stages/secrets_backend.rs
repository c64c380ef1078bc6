//! Vault: deploy, wait for pods, initialize/unseal, then core resources.

use anyhow::{Context, Result};
use tracing::info;

use crate::checkpoint::StepId;
use crate::context::InstallContext;
use crate::error::InstallError;
use crate::inputs::{InputOverride, InputShape};
use crate::modules::ModuleId;
use crate::proxy::with_proxy;
use crate::secrets::Sensitive;
use crate::ui;
use crate::vault::{VaultRitual, VAULT_WAIT_INPUT};

pub(super) async fn run(ctx: &InstallContext) -> Result<()> {
    let target = &ctx.target;
    let deployment = ctx
        .module(ModuleId::KubeVault)?
        .with_title("Deploy Vault")
        .with_input(InputOverride::set("vault_domain", InputShape::Domain, target.vault_domain()))
        .with_input(InputOverride::set(VAULT_WAIT_INPUT, InputShape::Bool, false))
        .with_input(InputOverride::set("ingress_enabled", InputShape::Bool, false));
    ctx.deploy(deployment).await?;

    ctx.ensure_not_interrupted()?;
    let probe = ctx.probe.as_ref();
    ctx.poller("Vault pods to be running", ctx.polls.vault_pods)
        .run(|| async move { anyhow::Ok(probe.pods_running("vault").await?) })
        .await
        .map_err(InstallError::from)?;

    ctx.ensure_not_interrupted()?;
    let outcome = VaultRitual::new(
        ctx.vault.as_ref(),
        ctx.secrets.as_ref(),
        target.module_dir(ModuleId::KubeVault),
        ctx.recovery,
    )
    .run()
    .await
    .context("Failed to initialize and unseal Vault")?;
    ctx.checkpoint.set_step_complete(StepId::VaultInitialized)?;
    if outcome.initialized {
        ui::print_success("Vault initialized; recovery material encrypted and stored");
    }
    info!(shares_applied = outcome.shares_applied, "Vault is unsealed");

    let token = outcome.root_token;
    with_proxy(
        ctx.proxies.as_ref(),
        &ctx.vault_proxy(token.clone(), "deploying Vault core resources"),
        |endpoint| async move {
            let deployment = ctx
                .module(ModuleId::VaultCoreResources)?
                .with_title("Deploy Vault core resources")
                .with_env("VAULT_ADDR", Sensitive::new(endpoint.address()))
                .with_env("VAULT_TOKEN", token);
            ctx.deploy(deployment).await?;
            anyhow::Ok(())
        },
    )
    .await
}
