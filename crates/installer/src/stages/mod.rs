//! Installation stages.
//!
//! Stages run in a fixed order. Before a stage runs, its
//! [`CompletionPredicate`] decides whether the work is already done; the
//! default predicate asks the status oracle about the stage's last module.

mod certificates;
mod extensions;
mod foundation;
mod networking;
mod secrets_backend;

use std::fmt;

use anyhow::Result;
use futures::future::{join_all, LocalBoxFuture};
use serde_yaml::Value;
use tracing::{error, warn};

use crate::checkpoint::StepId;
use crate::config::InstallationTarget;
use crate::context::InstallContext;
use crate::error::InstallError;
use crate::files;
use crate::inputs;
use crate::modules::{self, ModuleId};
use crate::status;

/// Flag on the cert-manager module that is set while bootstrapping certificates.
pub const SELF_GENERATED_CERTS_INPUT: &str = "self_generated_certs_enabled";

/// Installation stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Network,
    ClusterControlPlane,
    InternalNetworking,
    PolicyController,
    StorageDrivers,
    SecretsBackend,
    Certificates,
    ServiceMesh,
    InboundNetworking,
    Autoscaling,
    ClusterExtensions,
    Done,
}

impl Stage {
    /// Number of runnable stages.
    pub const TOTAL: u8 = 11;

    /// Runnable stages in order.
    pub const ORDER: [Stage; 11] = [
        Self::Network,
        Self::ClusterControlPlane,
        Self::InternalNetworking,
        Self::PolicyController,
        Self::StorageDrivers,
        Self::SecretsBackend,
        Self::Certificates,
        Self::ServiceMesh,
        Self::InboundNetworking,
        Self::Autoscaling,
        Self::ClusterExtensions,
    ];

    /// The stage after this one.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Network => Self::ClusterControlPlane,
            Self::ClusterControlPlane => Self::InternalNetworking,
            Self::InternalNetworking => Self::PolicyController,
            Self::PolicyController => Self::StorageDrivers,
            Self::StorageDrivers => Self::SecretsBackend,
            Self::SecretsBackend => Self::Certificates,
            Self::Certificates => Self::ServiceMesh,
            Self::ServiceMesh => Self::InboundNetworking,
            Self::InboundNetworking => Self::Autoscaling,
            Self::Autoscaling => Self::ClusterExtensions,
            Self::ClusterExtensions | Self::Done => Self::Done,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Network => "Setting up the network",
            Self::ClusterControlPlane => "Deploying the cluster control plane",
            Self::InternalNetworking => "Setting up internal cluster networking",
            Self::PolicyController => "Deploying the policy controller",
            Self::StorageDrivers => "Deploying storage drivers",
            Self::SecretsBackend => "Deploying and unsealing Vault",
            Self::Certificates => "Setting up certificate management",
            Self::ServiceMesh => "Deploying the service mesh",
            Self::InboundNetworking => "Setting up inbound networking",
            Self::Autoscaling => "Deploying autoscaling",
            Self::ClusterExtensions => "Deploying cluster extensions",
            Self::Done => "Done",
        }
    }

    /// Position for progress display, 1-based.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::Network => 1,
            Self::ClusterControlPlane => 2,
            Self::InternalNetworking => 3,
            Self::PolicyController => 4,
            Self::StorageDrivers => 5,
            Self::SecretsBackend => 6,
            Self::Certificates => 7,
            Self::ServiceMesh => 8,
            Self::InboundNetworking => 9,
            Self::Autoscaling => 10,
            Self::ClusterExtensions | Self::Done => 11,
        }
    }

    /// Checkpoint step recording the stage.
    #[must_use]
    pub fn step_id(self) -> Option<StepId> {
        match self {
            Self::Network => Some(StepId::Network),
            Self::ClusterControlPlane => Some(StepId::ClusterControlPlane),
            Self::InternalNetworking => Some(StepId::InternalNetworking),
            Self::PolicyController => Some(StepId::PolicyController),
            Self::StorageDrivers => Some(StepId::StorageDrivers),
            Self::SecretsBackend => Some(StepId::SecretsBackend),
            Self::Certificates => Some(StepId::Certificates),
            Self::ServiceMesh => Some(StepId::ServiceMesh),
            Self::InboundNetworking => Some(StepId::InboundNetworking),
            Self::Autoscaling => Some(StepId::Autoscaling),
            Self::ClusterExtensions => Some(StepId::ClusterExtensions),
            Self::Done => None,
        }
    }

    /// Predicate deciding whether the stage can be skipped.
    #[must_use]
    pub fn completion(self) -> &'static dyn CompletionPredicate {
        match self {
            Self::Network => &ModuleDeployed(ModuleId::AwsVpc),
            Self::ClusterControlPlane => &ModuleDeployed(ModuleId::AwsEks),
            Self::InternalNetworking => &ModuleDeployed(ModuleId::KubeCoreDns),
            Self::PolicyController => &ModuleDeployed(ModuleId::KubePolicies),
            Self::StorageDrivers => &ModuleDeployed(ModuleId::KubeAwsEbsCsi),
            Self::SecretsBackend => &ModuleDeployed(ModuleId::VaultCoreResources),
            Self::Certificates => &CertificatesFinalized,
            Self::ServiceMesh => &ModuleDeployed(ModuleId::KubeLinkerd),
            Self::InboundNetworking => &VaultAddressPublished,
            Self::Autoscaling => &ModuleDeployed(ModuleId::KubeScheduler),
            Self::ClusterExtensions => &AlwaysRun,
            Self::Done => &Finished,
        }
    }

    /// Execute the stage.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the stage.
    pub async fn run(self, ctx: &InstallContext) -> Result<()> {
        match self {
            Self::Network => foundation::network(ctx).await,
            Self::ClusterControlPlane => foundation::control_plane(ctx).await,
            Self::InternalNetworking => foundation::internal_networking(ctx).await,
            Self::PolicyController => foundation::policy_controller(ctx).await,
            Self::StorageDrivers => foundation::storage_drivers(ctx).await,
            Self::SecretsBackend => secrets_backend::run(ctx).await,
            Self::Certificates => certificates::run(ctx).await,
            Self::ServiceMesh => networking::service_mesh(ctx).await,
            Self::InboundNetworking => networking::inbound(ctx).await,
            Self::Autoscaling => foundation::autoscaling(ctx).await,
            Self::ClusterExtensions => extensions::run(ctx).await,
            Self::Done => Ok(()),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decides whether a stage's work is already done.
pub trait CompletionPredicate: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns an error if the state needed to decide cannot be read.
    fn is_complete(&self, target: &InstallationTarget) -> Result<bool, InstallError>;
}

/// Done when the oracle reports the module deployed.
#[derive(Debug, Clone, Copy)]
pub struct ModuleDeployed(pub ModuleId);

impl CompletionPredicate for ModuleDeployed {
    fn name(&self) -> &'static str {
        "module deployed"
    }

    fn is_complete(&self, target: &InstallationTarget) -> Result<bool, InstallError> {
        Ok(status::get_status(target, self.0).is_deployed())
    }
}

/// cert-manager is applied twice; only the second apply turns self-generated
/// certificates off, so the stage is done only once the flag is `false`.
#[derive(Debug, Clone, Copy)]
pub struct CertificatesFinalized;

impl CompletionPredicate for CertificatesFinalized {
    fn name(&self) -> &'static str {
        "cert-manager deployed with self-generated certificates disabled"
    }

    fn is_complete(&self, target: &InstallationTarget) -> Result<bool, InstallError> {
        let module = ModuleId::KubeCertManager;
        if !status::get_status(target, module).is_deployed() {
            return Ok(false);
        }
        let flag = inputs::read_flag(&target.module_dir(module), SELF_GENERATED_CERTS_INPUT)?;
        Ok(flag == Some(false))
    }
}

/// Ingress is deployed and Vault's public address was persisted afterwards.
#[derive(Debug, Clone, Copy)]
pub struct VaultAddressPublished;

impl CompletionPredicate for VaultAddressPublished {
    fn name(&self) -> &'static str {
        "ingress deployed and vault_addr persisted"
    }

    fn is_complete(&self, target: &InstallationTarget) -> Result<bool, InstallError> {
        if !status::get_status(target, ModuleId::KubeIngressNginx).is_deployed() {
            return Ok(false);
        }
        let region = files::read_yaml_mapping(&target.region_file())?;
        Ok(region
            .get("vault_addr")
            .and_then(Value::as_str)
            .is_some_and(|addr| !addr.is_empty()))
    }
}

/// Stages that track completion per branch and are always entered.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysRun;

impl CompletionPredicate for AlwaysRun {
    fn name(&self) -> &'static str {
        "always run"
    }

    fn is_complete(&self, _target: &InstallationTarget) -> Result<bool, InstallError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy)]
struct Finished;

impl CompletionPredicate for Finished {
    fn name(&self) -> &'static str {
        "finished"
    }

    fn is_complete(&self, _target: &InstallationTarget) -> Result<bool, InstallError> {
        Ok(true)
    }
}

/// One concurrent branch: modules it deploys (in order) and the work itself.
pub struct Branch<'a> {
    name: String,
    modules: Vec<ModuleId>,
    work: LocalBoxFuture<'a, Result<()>>,
}

impl<'a> Branch<'a> {
    pub fn new(name: impl Into<String>, modules: &[ModuleId], work: LocalBoxFuture<'a, Result<()>>) -> Self {
        Self {
            name: name.into(),
            modules: modules.to_vec(),
            work,
        }
    }
}

/// Run independent branches concurrently and wait for all of them.
///
/// Every branch runs to completion even when a sibling fails, so no module is
/// left half-applied by an abandoned future.
///
/// # Errors
///
/// Fails before starting anything when two branches depend on each other,
/// and afterwards when any branch failed.
pub async fn fan_out(branches: Vec<Branch<'_>>) -> Result<()> {
    let groups: Vec<&[ModuleId]> = branches.iter().map(|b| b.modules.as_slice()).collect();
    modules::ensure_independent(&groups)?;

    let total = branches.len();
    let results = join_all(
        branches
            .into_iter()
            .map(|branch| async move { (branch.name, branch.work.await) }),
    )
    .await;

    let mut failures = Vec::new();
    for (name, result) in results {
        if let Err(e) = result {
            error!(branch = %name, error = format!("{e:#}"), "Branch failed");
            failures.push((name, e));
        }
    }

    let mut failures = failures.into_iter();
    let Some((first_name, first)) = failures.next() else {
        return Ok(());
    };
    let others: Vec<String> = failures.map(|(name, _)| name).collect();
    if !others.is_empty() {
        warn!(branches = ?others, "Other branches also failed");
    }
    Err(first.context(format!(
        "{} of {total} concurrent branches failed (first: {first_name}{})",
        others.len() + 1,
        if others.is_empty() {
            String::new()
        } else {
            format!("; also: {}", others.join(", "))
        }
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::{InputOverride, InputShape};
    use crate::status::{update_module_status, DeployStatus, InitStatus};
    use crate::testing;
    use anyhow::anyhow;
    use futures::FutureExt;

    #[test]
    fn test_order_matches_next() {
        let mut stage = Stage::Network;
        for expected in Stage::ORDER {
            assert_eq!(stage, expected);
            stage = stage.next();
        }
        assert_eq!(stage, Stage::Done);
        assert_eq!(Stage::ORDER.len(), usize::from(Stage::TOTAL));
        assert_eq!(Stage::ClusterExtensions.step_number(), Stage::TOTAL);
    }

    #[test]
    fn test_default_predicate_follows_oracle() {
        let (_dir, target) = testing::target();
        let predicate = Stage::Network.completion();
        assert!(!predicate.is_complete(&target).unwrap());

        let dir = target.module_dir(ModuleId::AwsVpc);
        std::fs::create_dir_all(&dir).unwrap();
        update_module_status(&dir, Some(InitStatus::Success), Some(DeployStatus::Running)).unwrap();
        assert!(!predicate.is_complete(&target).unwrap());

        update_module_status(&dir, None, Some(DeployStatus::Success)).unwrap();
        assert!(predicate.is_complete(&target).unwrap());
    }

    #[test]
    fn test_certificates_require_flag_off() {
        let (_dir, target) = testing::target();
        let dir = target.module_dir(ModuleId::KubeCertManager);
        std::fs::create_dir_all(&dir).unwrap();
        let predicate = Stage::Certificates.completion();

        inputs::apply_overrides(
            ModuleId::KubeCertManager,
            &dir,
            &[InputOverride::set(SELF_GENERATED_CERTS_INPUT, InputShape::Bool, true)],
        )
        .unwrap();
        assert!(!predicate.is_complete(&target).unwrap());

        inputs::apply_overrides(
            ModuleId::KubeCertManager,
            &dir,
            &[InputOverride::set(SELF_GENERATED_CERTS_INPUT, InputShape::Bool, false)],
        )
        .unwrap();
        assert!(predicate.is_complete(&target).unwrap());
    }

    #[test]
    fn test_inbound_networking_needs_vault_addr() {
        let (_dir, target) = testing::target();
        std::fs::create_dir_all(target.module_dir(ModuleId::KubeIngressNginx)).unwrap();
        let predicate = Stage::InboundNetworking.completion();
        assert!(!predicate.is_complete(&target).unwrap());

        let mut values = serde_yaml::Mapping::new();
        values.insert("vault_addr".into(), "https://vault.prod.example.com".into());
        files::upsert_yaml(&target.region_file(), values).unwrap();
        assert!(predicate.is_complete(&target).unwrap());
    }

    #[test]
    fn test_extensions_always_run() {
        let (_dir, target) = testing::target();
        for module in ModuleId::ALL {
            std::fs::create_dir_all(target.module_dir(module)).unwrap();
        }
        assert!(!Stage::ClusterExtensions.completion().is_complete(&target).unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_rejects_dependent_branches() {
        let ran = std::cell::Cell::new(false);
        let branches = vec![
            Branch::new("snapshotter", &[ModuleId::KubeExternalSnapshotter], async {
                ran.set(true);
                anyhow::Ok(())
            }
            .boxed_local()),
            Branch::new("velero", &[ModuleId::KubeVelero], async { anyhow::Ok(()) }.boxed_local()),
        ];

        let err = fan_out(branches).await.unwrap_err();
        assert!(err.downcast_ref::<InstallError>().is_some());
        assert!(!ran.get());
    }

    #[tokio::test]
    async fn test_fan_out_runs_every_branch_and_reports_failures() {
        let finished = std::cell::Cell::new(0);
        let branches = vec![
            Branch::new("keda", &[ModuleId::KubeKeda], async {
                finished.set(finished.get() + 1);
                Err::<(), _>(anyhow!("keda failed"))
            }
            .boxed_local()),
            Branch::new("reloader", &[ModuleId::KubeReloader], async {
                finished.set(finished.get() + 1);
                anyhow::Ok(())
            }
            .boxed_local()),
            Branch::new("descheduler", &[ModuleId::KubeDescheduler], async {
                finished.set(finished.get() + 1);
                Err::<(), _>(anyhow!("descheduler failed"))
            }
            .boxed_local()),
        ];

        let err = fan_out(branches).await.unwrap_err();
        assert_eq!(finished.get(), 3);
        let message = format!("{err:#}");
        assert!(message.contains("2 of 3"));
        assert!(message.contains("descheduler"));
        assert!(message.contains("keda failed"));
    }
}
