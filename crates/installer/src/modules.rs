//! Deployable infrastructure modules.
//!
//! Every module lives in its own directory under the region directory and is
//! applied independently by the apply engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InstallError;

/// Stable identifier of a deployable module. Doubles as its directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleId {
    AwsVpc,
    AwsEks,
    KubeCilium,
    KubeCoreDns,
    KubeKyverno,
    KubePolicies,
    KubeAwsEbsCsi,
    KubeVault,
    VaultCoreResources,
    KubeCertManager,
    KubeCertIssuers,
    KubeLinkerd,
    KubeAwsLbController,
    KubeExternalDns,
    KubeIngressNginx,
    KubeMetricsServer,
    KubeVpa,
    KubeKarpenter,
    KubeKarpenterNodePools,
    KubeScheduler,
    KubeBastion,
    KubeExternalSnapshotter,
    KubeVelero,
    KubeKeda,
    KubeReloader,
    KubeNodeImageCacheController,
    KubePvcAutoresizer,
    KubeDescheduler,
    KubeCloudnativePg,
}

impl ModuleId {
    /// All modules in installation order. A module never precedes its dependencies.
    pub const ALL: [ModuleId; 29] = [
        Self::AwsVpc,
        Self::AwsEks,
        Self::KubeCilium,
        Self::KubeCoreDns,
        Self::KubeKyverno,
        Self::KubePolicies,
        Self::KubeAwsEbsCsi,
        Self::KubeVault,
        Self::VaultCoreResources,
        Self::KubeCertManager,
        Self::KubeCertIssuers,
        Self::KubeLinkerd,
        Self::KubeAwsLbController,
        Self::KubeExternalDns,
        Self::KubeIngressNginx,
        Self::KubeMetricsServer,
        Self::KubeVpa,
        Self::KubeKarpenter,
        Self::KubeKarpenterNodePools,
        Self::KubeScheduler,
        Self::KubeBastion,
        Self::KubeExternalSnapshotter,
        Self::KubeVelero,
        Self::KubeKeda,
        Self::KubeReloader,
        Self::KubeNodeImageCacheController,
        Self::KubePvcAutoresizer,
        Self::KubeDescheduler,
        Self::KubeCloudnativePg,
    ];

    /// Directory name of the module inside the region directory.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::AwsVpc => "aws_vpc",
            Self::AwsEks => "aws_eks",
            Self::KubeCilium => "kube_cilium",
            Self::KubeCoreDns => "kube_core_dns",
            Self::KubeKyverno => "kube_kyverno",
            Self::KubePolicies => "kube_policies",
            Self::KubeAwsEbsCsi => "kube_aws_ebs_csi",
            Self::KubeVault => "kube_vault",
            Self::VaultCoreResources => "vault_core_resources",
            Self::KubeCertManager => "kube_cert_manager",
            Self::KubeCertIssuers => "kube_cert_issuers",
            Self::KubeLinkerd => "kube_linkerd",
            Self::KubeAwsLbController => "kube_aws_lb_controller",
            Self::KubeExternalDns => "kube_external_dns",
            Self::KubeIngressNginx => "kube_ingress_nginx",
            Self::KubeMetricsServer => "kube_metrics_server",
            Self::KubeVpa => "kube_vpa",
            Self::KubeKarpenter => "kube_karpenter",
            Self::KubeKarpenterNodePools => "kube_karpenter_node_pools",
            Self::KubeScheduler => "kube_scheduler",
            Self::KubeBastion => "kube_bastion",
            Self::KubeExternalSnapshotter => "kube_external_snapshotter",
            Self::KubeVelero => "kube_velero",
            Self::KubeKeda => "kube_keda",
            Self::KubeReloader => "kube_reloader",
            Self::KubeNodeImageCacheController => "kube_node_image_cache_controller",
            Self::KubePvcAutoresizer => "kube_pvc_autoresizer",
            Self::KubeDescheduler => "kube_descheduler",
            Self::KubeCloudnativePg => "kube_cloudnative_pg",
        }
    }

    /// Modules that must be deployed before this one.
    #[must_use]
    pub const fn depends_on(self) -> &'static [ModuleId] {
        match self {
            Self::AwsVpc => &[],
            Self::AwsEks => &[Self::AwsVpc],
            Self::KubeCilium => &[Self::AwsEks],
            Self::KubeCoreDns => &[Self::KubeCilium],
            Self::KubeKyverno => &[Self::KubeCoreDns],
            Self::KubePolicies => &[Self::KubeKyverno],
            Self::KubeAwsEbsCsi => &[Self::KubePolicies],
            Self::KubeVault => &[Self::KubeAwsEbsCsi],
            Self::VaultCoreResources => &[Self::KubeVault],
            Self::KubeCertManager => &[Self::VaultCoreResources],
            Self::KubeCertIssuers => &[Self::KubeCertManager],
            Self::KubeLinkerd => &[Self::KubeCertIssuers],
            Self::KubeAwsLbController | Self::KubeExternalDns => &[Self::KubeLinkerd],
            Self::KubeIngressNginx => &[Self::KubeAwsLbController, Self::KubeExternalDns],
            Self::KubeMetricsServer => &[Self::KubeIngressNginx],
            Self::KubeVpa => &[Self::KubeMetricsServer],
            Self::KubeKarpenter => &[Self::KubeVpa],
            Self::KubeKarpenterNodePools => &[Self::KubeKarpenter],
            Self::KubeScheduler => &[Self::KubeKarpenterNodePools],
            Self::KubeVelero => &[Self::KubeExternalSnapshotter],
            Self::KubeBastion
            | Self::KubeExternalSnapshotter
            | Self::KubeKeda
            | Self::KubeReloader
            | Self::KubeNodeImageCacheController
            | Self::KubePvcAutoresizer
            | Self::KubeDescheduler
            | Self::KubeCloudnativePg => &[Self::KubeScheduler],
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Check that no module in one group directly depends on a module in another.
///
/// Groups are the branches of a concurrent fan-out; modules inside the same
/// group run sequentially and may depend on each other.
///
/// # Errors
///
/// Returns [`InstallError::DependentBranches`] for the first violating pair.
pub fn ensure_independent(groups: &[&[ModuleId]]) -> Result<(), InstallError> {
    for (i, group) in groups.iter().enumerate() {
        for (j, other) in groups.iter().enumerate() {
            if i == j {
                continue;
            }
            for module in group.iter() {
                if let Some(dep) = module.depends_on().iter().find(|dep| other.contains(*dep)) {
                    return Err(InstallError::DependentBranches {
                        first: *dep,
                        second: *module,
                    });
                }
            }
        }
    }
    Ok(())
}
