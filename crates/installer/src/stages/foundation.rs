//! Sequential stages: network, control plane, in-cluster basics and autoscaling.

use anyhow::Result;

use crate::checkpoint::InputKey;
use crate::context::InstallContext;
use crate::inputs::{InputOverride, InputShape};
use crate::modules::ModuleId;

/// Deploy `modules` one after another with their default configuration.
async fn deploy_chain(ctx: &InstallContext, modules: &[ModuleId]) -> Result<()> {
    for module in modules {
        ctx.deploy(ctx.module(*module)?).await?;
    }
    Ok(())
}

pub(super) async fn network(ctx: &InstallContext) -> Result<()> {
    let target = &ctx.target;
    let deployment = ctx
        .module(ModuleId::AwsVpc)?
        .with_title("Deploy the VPC")
        .with_input(InputOverride::set("vpc_name", InputShape::KubeName, target.cluster_key()))
        .with_input(InputOverride::set(
            "vpc_description",
            InputShape::Description,
            format!("VPC for the {} cluster in {}", target.environment, target.region),
        ));
    ctx.deploy(deployment).await?;
    Ok(())
}

pub(super) async fn control_plane(ctx: &InstallContext) -> Result<()> {
    let target = &ctx.target;
    let cluster_name = ctx.saved_or_prompt(
        InputKey::ClusterName,
        "Cluster name",
        Some(&target.cluster_key()),
    )?;
    let cluster_description = ctx.saved_or_prompt(
        InputKey::ClusterDescription,
        "Cluster description",
        Some(&format!("{} cluster in {}", target.environment, target.region)),
    )?;

    let deployment = ctx
        .module(ModuleId::AwsEks)?
        .with_title("Deploy the EKS control plane")
        .with_input(InputOverride::set("cluster_name", InputShape::KubeName, cluster_name))
        .with_input(InputOverride::set(
            "cluster_description",
            InputShape::Description,
            cluster_description,
        ))
        .with_input(InputOverride::set("bootstrap_mode_enabled", InputShape::Bool, true));
    ctx.deploy(deployment).await?;
    Ok(())
}

pub(super) async fn internal_networking(ctx: &InstallContext) -> Result<()> {
    deploy_chain(ctx, &[ModuleId::KubeCilium, ModuleId::KubeCoreDns]).await
}

pub(super) async fn policy_controller(ctx: &InstallContext) -> Result<()> {
    deploy_chain(ctx, &[ModuleId::KubeKyverno, ModuleId::KubePolicies]).await
}

pub(super) async fn storage_drivers(ctx: &InstallContext) -> Result<()> {
    deploy_chain(ctx, &[ModuleId::KubeAwsEbsCsi]).await
}

pub(super) async fn autoscaling(ctx: &InstallContext) -> Result<()> {
    deploy_chain(
        ctx,
        &[
            ModuleId::KubeMetricsServer,
            ModuleId::KubeVpa,
            ModuleId::KubeKarpenter,
            ModuleId::KubeKarpenterNodePools,
            ModuleId::KubeScheduler,
        ],
    )
    .await
}
