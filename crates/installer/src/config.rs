//! Installation configuration types.
//!
//! Repository configuration is layered: `environment.yaml` in the environment
//! directory provides defaults that `region.yaml` in the region directory
//! overrides key by key. The resolved values are frozen into an
//! [`InstallationTarget`] once per run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::InstallError;
use crate::files;
use crate::modules::ModuleId;
use crate::poll::PollSpec;

/// Environment-level configuration file.
pub const ENVIRONMENT_FILE: &str = "environment.yaml";
/// Region-level configuration file.
pub const REGION_FILE: &str = "region.yaml";
/// Default checkpoint file inside the region directory.
pub const CHECKPOINT_FILE: &str = ".install-checkpoint.json";

/// Availability tier of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum SlaTarget {
    /// Single availability zone, cheapest.
    #[default]
    One,
    /// Multi-zone control plane and workloads.
    Two,
    /// Fully redundant, highest cost.
    Three,
}

impl SlaTarget {
    /// All tiers in ascending order.
    pub const ALL: [SlaTarget; 3] = [Self::One, Self::Two, Self::Three];

    /// Short description shown when the operator picks a tier.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::One => "Level 1: 99.9% uptime, single AZ, lowest cost",
            Self::Two => "Level 2: 99.99% uptime, multi-AZ",
            Self::Three => "Level 3: 99.999% uptime, multi-AZ with redundant capacity",
        }
    }
}

impl TryFrom<u8> for SlaTarget {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(format!("sla_target must be 1, 2, or 3 (got {other})")),
        }
    }
}

impl From<SlaTarget> for u8 {
    fn from(value: SlaTarget) -> Self {
        match value {
            SlaTarget::One => 1,
            SlaTarget::Two => 2,
            SlaTarget::Three => 3,
        }
    }
}

impl std::fmt::Display for SlaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// DNS zone the environment may use for cluster domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Hosted zone identifier.
    pub zone_id: String,
    /// Role allowed to manage records in the zone.
    pub record_manager_role_arn: String,
}

/// Merged view of `environment.yaml` and `region.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayeredConfig {
    pub environment: Option<String>,
    pub region: Option<String>,
    pub aws_profile: Option<String>,
    pub aws_region: Option<String>,
    pub kube_config_context: Option<String>,
    pub kube_domain: Option<String>,
    pub sla_target: Option<SlaTarget>,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    pub vault_addr: Option<String>,
}

/// Directory layout around a region directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    /// Directory holding every environment.
    pub environments_dir: PathBuf,
    /// Environment directory (contains `environment.yaml`).
    pub environment_dir: PathBuf,
    /// Region directory (contains `region.yaml` and the modules).
    pub region_dir: PathBuf,
}

impl RegionLayout {
    /// Resolve the layout from a region directory.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `dir` is not a region directory inside
    /// an environment directory.
    pub fn discover(dir: &Path) -> Result<Self, InstallError> {
        if !dir.join(REGION_FILE).is_file() {
            return Err(InstallError::precondition(
                format!("{} is not a region directory (no {REGION_FILE})", dir.display()),
                "Run the installer from the region directory of the cluster you want to install, or pass --directory",
            ));
        }
        let environment_dir = dir
            .parent()
            .filter(|parent| parent.join(ENVIRONMENT_FILE).is_file())
            .ok_or_else(|| {
                InstallError::precondition(
                    format!("{} is not inside an environment directory", dir.display()),
                    format!("Create {ENVIRONMENT_FILE} in the parent directory of the region"),
                )
            })?;
        let environments_dir = environment_dir
            .parent()
            .map_or_else(|| environment_dir.to_path_buf(), Path::to_path_buf);

        Ok(Self {
            environments_dir,
            environment_dir: environment_dir.to_path_buf(),
            region_dir: dir.to_path_buf(),
        })
    }

    /// Load both layers and merge them, region values winning.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is unreadable or the merged values do
    /// not match [`LayeredConfig`].
    pub fn load_config(&self) -> Result<LayeredConfig, InstallError> {
        let mut merged = files::read_yaml_mapping(&self.environment_dir.join(ENVIRONMENT_FILE))?;
        for (key, value) in files::read_yaml_mapping(&self.region_dir.join(REGION_FILE))? {
            merged.insert(key, value);
        }
        serde_yaml::from_value(Value::Mapping(merged)).map_err(|e| InstallError::Parse {
            path: self.region_dir.join(REGION_FILE),
            reason: e.to_string(),
        })
    }

    /// Persist key/value pairs into `region.yaml`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be updated.
    pub fn upsert_region_values(&self, values: Mapping) -> Result<(), InstallError> {
        files::upsert_yaml(&self.region_dir.join(REGION_FILE), values)
    }

    /// `kube_domain` values claimed by the other regions of every environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the environments directory cannot be listed.
    pub fn other_region_domains(&self) -> Result<Vec<String>, InstallError> {
        let read_dir = |path: &Path| {
            std::fs::read_dir(path).map_err(|source| InstallError::Read {
                path: path.to_path_buf(),
                source,
            })
        };

        let mut domains = Vec::new();
        for environment in read_dir(&self.environments_dir)?.flatten() {
            let environment_path = environment.path();
            if !environment_path.is_dir() {
                continue;
            }
            for region in read_dir(&environment_path)?.flatten() {
                let region_path = region.path();
                if !region_path.is_dir() || region_path == self.region_dir {
                    continue;
                }
                let domain = files::read_yaml_mapping(&region_path.join(REGION_FILE))
                    .ok()
                    .and_then(|m| m.get("kube_domain").and_then(Value::as_str).map(str::to_string));
                if let Some(domain) = domain {
                    domains.push(domain);
                }
            }
        }
        Ok(domains)
    }
}

/// Everything that identifies the cluster being installed. Immutable per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationTarget {
    pub environment: String,
    pub region: String,
    pub environments_dir: PathBuf,
    pub environment_dir: PathBuf,
    pub region_dir: PathBuf,
    pub sla_target: SlaTarget,
    pub aws_profile: String,
    pub aws_region: String,
    pub kube_context: Option<String>,
    pub kube_domain: String,
    pub domains: BTreeMap<String, DomainConfig>,
}

impl InstallationTarget {
    /// Directory holding the given module.
    #[must_use]
    pub fn module_dir(&self, module: ModuleId) -> PathBuf {
        self.region_dir.join(module.dir_name())
    }

    /// Path of `region.yaml`.
    #[must_use]
    pub fn region_file(&self) -> PathBuf {
        self.region_dir.join(REGION_FILE)
    }

    /// Identifier used for the cluster in shared files.
    #[must_use]
    pub fn cluster_key(&self) -> String {
        format!("{}-{}", self.environment, self.region)
    }

    /// Kubernetes context used to reach the cluster.
    #[must_use]
    pub fn kube_context(&self) -> String {
        self.kube_context
            .clone()
            .unwrap_or_else(|| self.cluster_key())
    }

    /// Domain Vault is exposed on.
    #[must_use]
    pub fn vault_domain(&self) -> String {
        format!("vault.{}", self.kube_domain)
    }

    /// Directory holding SSH connection info shared by every environment.
    #[must_use]
    pub fn ssh_dir(&self) -> PathBuf {
        self.environments_dir
            .parent()
            .map_or_else(|| self.environments_dir.join(".ssh"), |root| root.join(".ssh"))
    }
}

/// Attempt limits and delays for every bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Vault pods reaching `Running`.
    pub vault_pods: PollSpec,
    /// Vault's public health endpoint answering.
    pub vault_health: PollSpec,
    /// Ingress certificate becoming ready.
    pub certificate_ready: PollSpec,
    /// Local proxy accepting connections.
    pub proxy_ready: PollSpec,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            vault_pods: PollSpec::new(60, Duration::from_secs(10)),
            vault_health: PollSpec::new(180, Duration::from_secs(10)),
            certificate_ready: PollSpec::new(10, Duration::from_secs(90)),
            proxy_ready: PollSpec::new(40, Duration::from_millis(250)),
        }
    }
}
