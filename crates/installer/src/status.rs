//! Module status oracle.
//!
//! Deployment state is read from a small YAML record next to each module's
//! configuration, never from the checkpoint. A module directory without a
//! record counts as deployed: it was installed by hand or by an earlier tool.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::InstallationTarget;
use crate::error::InstallError;
use crate::files;
use crate::modules::ModuleId;

/// Status record written next to every module configuration.
pub const MODULE_STATUS_FILE: &str = ".status.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    #[default]
    Uninited,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    #[default]
    Undeployed,
    Running,
    Success,
    Error,
}

/// Observed state of one module. Computed on demand, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleStatus {
    pub environment_exists: bool,
    pub region_exists: bool,
    pub module_exists: bool,
    pub init_status: InitStatus,
    pub deploy_status: DeployStatus,
}

impl ModuleStatus {
    /// Whether the last apply of the module succeeded.
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        self.deploy_status == DeployStatus::Success
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusRecord {
    #[serde(default)]
    init_status: InitStatus,
    #[serde(default)]
    deploy_status: DeployStatus,
}

/// Query a module's status. A corrupt record is logged and reported as
/// never deployed.
#[must_use]
pub fn get_status(target: &InstallationTarget, module: ModuleId) -> ModuleStatus {
    let status = presence(target, module);
    if !status.module_exists {
        return status;
    }
    let record = read_record(&status_path(target, module)).unwrap_or_else(|err| {
        warn!(module = %module, error = %err, "Ignoring unreadable module status");
        Some(StatusRecord::default())
    });
    status.with_record(record)
}

/// Query a module's status, failing on a corrupt record.
///
/// # Errors
///
/// Returns [`InstallError::CorruptStatus`] when the record cannot be parsed.
pub fn get_status_strict(
    target: &InstallationTarget,
    module: ModuleId,
) -> Result<ModuleStatus, InstallError> {
    let status = presence(target, module);
    if !status.module_exists {
        return Ok(status);
    }
    let record = read_record(&status_path(target, module))?;
    Ok(status.with_record(record))
}

fn presence(target: &InstallationTarget, module: ModuleId) -> ModuleStatus {
    ModuleStatus {
        environment_exists: target.environment_dir.is_dir(),
        region_exists: target.region_dir.is_dir(),
        module_exists: target.module_dir(module).is_dir(),
        init_status: InitStatus::Uninited,
        deploy_status: DeployStatus::Undeployed,
    }
}

fn status_path(target: &InstallationTarget, module: ModuleId) -> std::path::PathBuf {
    target.module_dir(module).join(MODULE_STATUS_FILE)
}

impl ModuleStatus {
    fn with_record(mut self, record: Option<StatusRecord>) -> Self {
        let record = record.unwrap_or(StatusRecord {
            init_status: InitStatus::Success,
            deploy_status: DeployStatus::Success,
        });
        self.init_status = record.init_status;
        self.deploy_status = record.deploy_status;
        self
    }
}

fn read_record(path: &Path) -> Result<Option<StatusRecord>, InstallError> {
    files::read_yaml::<StatusRecord>(path).map_err(|err| match err {
        InstallError::Parse { path, reason } => InstallError::CorruptStatus { path, reason },
        other => other,
    })
}

/// Update the status record of the module in `module_dir`.
///
/// Fields passed as `None` keep their current value.
///
/// # Errors
///
/// Returns an error if the record cannot be written.
pub fn update_module_status(
    module_dir: &Path,
    init_status: Option<InitStatus>,
    deploy_status: Option<DeployStatus>,
) -> Result<(), InstallError> {
    let path = module_dir.join(MODULE_STATUS_FILE);
    let mut record = read_record(&path).ok().flatten().unwrap_or_default();
    if let Some(init_status) = init_status {
        record.init_status = init_status;
    }
    if let Some(deploy_status) = deploy_status {
        record.deploy_status = deploy_status;
    }
    files::write_yaml(&path, &record)
}
