//! Service mesh and inbound networking.

use anyhow::Result;
use futures::FutureExt;
use serde_yaml::{Mapping, Value};
use tracing::info;

use super::certificates::wait_for_certificates;
use super::{fan_out, Branch};
use crate::checkpoint::{InputKey, StepId};
use crate::context::InstallContext;
use crate::deploy::ModuleDeployment;
use crate::error::InstallError;
use crate::files;
use crate::inputs::{InputOverride, InputShape};
use crate::modules::ModuleId;
use crate::proxy::with_proxy;
use crate::secrets::Sensitive;
use crate::ui;

pub(super) async fn service_mesh(ctx: &InstallContext) -> Result<()> {
    let token = ctx.root_token().await?;
    with_proxy(
        ctx.proxies.as_ref(),
        &ctx.vault_proxy(token.clone(), "deploying the service mesh"),
        |endpoint| async move {
            let deployment = ctx
                .module(ModuleId::KubeLinkerd)?
                .with_title("Deploy Linkerd")
                .with_env("VAULT_ADDR", Sensitive::new(endpoint.address()))
                .with_env("VAULT_TOKEN", token);
            ctx.deploy(deployment).await?;
            anyhow::Ok(())
        },
    )
    .await
}

/// Public subnets the load balancer controller may use for the SLA tier.
fn load_balancer_subnets(ctx: &InstallContext) -> Value {
    let subnets: &[&str] = if u8::from(ctx.target.sla_target) == 1 {
        &["PUBLIC_A", "PUBLIC_B"]
    } else {
        &["PUBLIC_A", "PUBLIC_B", "PUBLIC_C"]
    };
    Value::Sequence(subnets.iter().map(|s| Value::from(*s)).collect())
}

async fn deploy_ingress(ctx: &InstallContext, address: &Sensitive, token: &Sensitive) -> Result<()> {
    let with_vault = |deployment: ModuleDeployment| {
        deployment
            .with_env("VAULT_ADDR", address.clone())
            .with_env("VAULT_TOKEN", token.clone())
    };

    let lb_controller = with_vault(
        ctx.module(ModuleId::KubeAwsLbController)?
            .with_title("Deploy the AWS load balancer controller")
            .with_input(InputOverride::set("subnets", InputShape::Any, load_balancer_subnets(ctx))),
    );
    let external_dns = with_vault(ctx.module(ModuleId::KubeExternalDns)?.with_title("Deploy External DNS"));
    fan_out(vec![
        Branch::new(
            "load balancer controller",
            &[ModuleId::KubeAwsLbController],
            async move { ctx.deploy(lb_controller).await.map(|_| ()) }.boxed_local(),
        ),
        Branch::new(
            "external dns",
            &[ModuleId::KubeExternalDns],
            async move { ctx.deploy(external_dns).await.map(|_| ()) }.boxed_local(),
        ),
    ])
    .await?;

    // Bootstrapped at SLA 1 so a single zone suffices; the real tier applies afterwards.
    let ingress = with_vault(
        ctx.module(ModuleId::KubeIngressNginx)?
            .with_title("Deploy Ingress NGINX")
            .with_input(InputOverride::set(
                "ingress_domains",
                InputShape::Any,
                Value::Sequence(vec![Value::from(ctx.target.kube_domain.clone())]),
            ))
            .with_input(InputOverride::set("sla_level", InputShape::Integer { min: 1, max: 3 }, 1))
            .with_post_deploy_input(InputOverride::set(
                "sla_level",
                InputShape::Integer { min: 1, max: 3 },
                u8::from(ctx.target.sla_target),
            )),
    );
    // The ingress certificate can stall cert-manager while the ingress rolls out.
    futures::try_join!(ctx.deploy(ingress), async {
        wait_for_certificates(ctx, ModuleId::KubeIngressNginx)
            .await
            .map_err(anyhow::Error::from)
    })?;

    ctx.deploy(with_vault(
        ctx.module(ModuleId::KubeVault)?
            .with_title("Expose Vault through the ingress")
            .with_input(InputOverride::set("ingress_enabled", InputShape::Bool, true))
            .skip_if_already_applied(false),
    ))
    .await?;
    Ok(())
}

async fn wait_for_vault_ingress(ctx: &InstallContext, url: &str) -> Result<(), InstallError> {
    ui::print_warning("This can take 10-30 minutes while DNS propagates");
    let probe = ctx.probe.as_ref();
    ctx.poller("the Vault health endpoint", ctx.polls.vault_health)
        .run(|| async move { anyhow::Ok(probe.endpoint_healthy(url).await?) })
        .await?;
    Ok(())
}

pub(super) async fn inbound(ctx: &InstallContext) -> Result<()> {
    let token = ctx.root_token().await?;
    with_proxy(
        ctx.proxies.as_ref(),
        &ctx.vault_proxy(token.clone(), "deploying inbound networking"),
        |endpoint| {
            let token = token.clone();
            async move { deploy_ingress(ctx, &Sensitive::new(endpoint.address()), &token).await }
        },
    )
    .await?;

    ctx.ensure_not_interrupted()?;
    let vault_addr = format!("https://{}", ctx.target.vault_domain());
    wait_for_vault_ingress(ctx, &format!("{vault_addr}/v1/sys/health")).await?;

    let mut values = Mapping::new();
    values.insert("vault_addr".into(), Value::from(vault_addr.clone()));
    files::upsert_yaml(&ctx.target.region_file(), values)?;
    ctx.checkpoint.update_saved_input(InputKey::VaultAddress, vault_addr.clone())?;
    ctx.checkpoint.set_step_complete(StepId::VaultAddressPersisted)?;
    info!(vault_addr = %vault_addr, "Persisted Vault address");

    // The permanent address now comes from region.yaml.
    let deployment = ctx
        .module(ModuleId::VaultCoreResources)?
        .with_title("Deploy Vault core resources with the permanent address")
        .with_env("VAULT_TOKEN", token)
        .skip_if_already_applied(false);
    ctx.deploy(deployment).await?;
    Ok(())
}
