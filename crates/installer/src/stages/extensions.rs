//! Cluster extensions, deployed as concurrent independent branches.
//!
//! This stage is always entered; every branch decides for itself whether its
//! work is already done.

use anyhow::{Context, Result};
use futures::FutureExt;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::{fan_out, Branch};
use crate::apply::{read_outputs, ApplyRequest};
use crate::checkpoint::StepId;
use crate::context::InstallContext;
use crate::files;
use crate::inputs::{self, InputOverride, InputShape};
use crate::modules::ModuleId;
use crate::status;

/// SSH connection details shared by every cluster of the repository.
pub const CONNECTION_INFO_FILE: &str = "connection_info.yaml";
const BOOTSTRAP_MODE_INPUT: &str = "bootstrap_mode_enabled";

/// Standalone extensions with no ordering among themselves.
const STANDALONE: [ModuleId; 6] = [
    ModuleId::KubeKeda,
    ModuleId::KubeReloader,
    ModuleId::KubeNodeImageCacheController,
    ModuleId::KubePvcAutoresizer,
    ModuleId::KubeDescheduler,
    ModuleId::KubeCloudnativePg,
];

#[derive(Debug, Deserialize)]
struct BastionOutputs {
    bastion_domains: Vec<String>,
    bastion_port: u16,
}

/// Record how to reach the cluster's bastion in the shared SSH directory.
async fn write_bastion_connectivity(ctx: &InstallContext) -> Result<()> {
    if ctx.checkpoint.is_step_complete(StepId::BastionConnectivity) {
        debug!("Bastion connection info already written");
        return Ok(());
    }
    ctx.ensure_not_interrupted()?;

    let module = ModuleId::KubeBastion;
    let request = ApplyRequest {
        module,
        module_dir: ctx.target.module_dir(module),
        env: Default::default(),
    };
    let outputs: BastionOutputs = read_outputs(ctx.apply.as_ref(), &request)
        .await
        .context("Failed to read bastion outputs")?;

    let mut entry = Mapping::new();
    entry.insert(
        "domains".into(),
        Value::Sequence(outputs.bastion_domains.into_iter().map(Value::from).collect()),
    );
    entry.insert("port".into(), Value::from(outputs.bastion_port));
    let mut values = Mapping::new();
    values.insert(ctx.target.cluster_key().into(), Value::Mapping(entry));

    let path = ctx.target.ssh_dir().join(CONNECTION_INFO_FILE);
    files::upsert_yaml(&path, values)?;
    ctx.checkpoint.set_step_complete(StepId::BastionConnectivity)?;
    info!(path = %path.display(), "Wrote bastion connection info");
    Ok(())
}

async fn bastion(ctx: &InstallContext) -> Result<()> {
    ctx.deploy(ctx.module(ModuleId::KubeBastion)?.with_title("Deploy the bastion"))
        .await?;
    write_bastion_connectivity(ctx).await
}

async fn backups(ctx: &InstallContext) -> Result<()> {
    ctx.deploy(ctx.module(ModuleId::KubeExternalSnapshotter)?).await?;
    ctx.deploy(ctx.module(ModuleId::KubeVelero)?).await?;
    Ok(())
}

/// Turn off the control plane's bootstrap mode now that autoscaling runs the nodes.
async fn adjust_node_pools(ctx: &InstallContext) -> Result<()> {
    let module = ModuleId::AwsEks;
    let already_adjusted = status::get_status(&ctx.target, module).is_deployed()
        && inputs::read_flag(&ctx.target.module_dir(module), BOOTSTRAP_MODE_INPUT)? == Some(false);
    let deployment = ctx
        .module(module)?
        .with_title("Adjust EKS node pools")
        .with_input(InputOverride::set(BOOTSTRAP_MODE_INPUT, InputShape::Bool, false))
        .skip_if_already_applied(already_adjusted);
    ctx.deploy(deployment).await?;
    Ok(())
}

pub(super) async fn run(ctx: &InstallContext) -> Result<()> {
    let mut branches = vec![
        Branch::new("bastion", &[ModuleId::KubeBastion], bastion(ctx).boxed_local()),
        Branch::new(
            "backups",
            &[ModuleId::KubeExternalSnapshotter, ModuleId::KubeVelero],
            backups(ctx).boxed_local(),
        ),
        Branch::new("node pools", &[ModuleId::AwsEks], adjust_node_pools(ctx).boxed_local()),
    ];
    for module in STANDALONE {
        branches.push(Branch::new(
            module.dir_name(),
            &[module],
            async move {
                ctx.deploy(ctx.module(module)?).await?;
                anyhow::Ok(())
            }
            .boxed_local(),
        ));
    }
    fan_out(branches).await
}
