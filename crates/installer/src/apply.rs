//! Apply engine: runs Terragrunt against a single module directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::InstallError;
use crate::modules::ModuleId;

static PLAN_SUMMARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(\d+) added, (\d+) changed, (\d+) destroyed").ok()
});

/// One apply (or output read) of a module.
#[derive(Clone)]
pub struct ApplyRequest {
    pub module: ModuleId,
    pub module_dir: PathBuf,
    /// Extra environment for the engine; values may be secrets.
    pub env: BTreeMap<String, String>,
}

impl fmt::Debug for ApplyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyRequest")
            .field("module", &self.module)
            .field("module_dir", &self.module_dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Result of an apply the engine managed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub success: bool,
    pub log_output: String,
}

/// Resource counts reported by an apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
}

impl ChangeSummary {
    /// Extract the last `N added, N changed, N destroyed` line from a log.
    #[must_use]
    pub fn from_log(log: &str) -> Option<Self> {
        let re = PLAN_SUMMARY.as_ref()?;
        let caps = re.captures_iter(log).last()?;
        Some(Self {
            added: caps[1].parse().ok()?,
            changed: caps[2].parse().ok()?,
            destroyed: caps[3].parse().ok()?,
        })
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} ~{} -{}", self.added, self.changed, self.destroyed)
    }
}

/// Applies modules and reads their outputs.
#[async_trait]
pub trait ApplyEngine: Send + Sync {
    /// Apply a module. `Err` only when the engine could not run at all.
    async fn apply_module(&self, request: &ApplyRequest) -> Result<ApplyOutcome, InstallError>;

    /// Read a module's outputs as `{name: {value: ...}}`.
    async fn read_module_outputs(&self, request: &ApplyRequest) -> Result<Value, InstallError>;
}

/// Read a module's outputs into `T`, whose fields name the expected outputs.
///
/// # Errors
///
/// Returns an error if the outputs cannot be read or do not match `T`.
pub async fn read_outputs<T: DeserializeOwned>(
    engine: &dyn ApplyEngine,
    request: &ApplyRequest,
) -> Result<T, InstallError> {
    let raw = engine.read_module_outputs(request).await?;
    let values = match raw {
        Value::Object(outputs) => outputs
            .into_iter()
            .map(|(name, output)| match output {
                Value::Object(mut fields) if fields.contains_key("value") => {
                    (name, fields.remove("value").unwrap_or(Value::Null))
                }
                other => (name, other),
            })
            .collect(),
        other => {
            return Err(InstallError::ApplyEngine {
                module: request.module,
                reason: format!("unexpected outputs document: {other}"),
            })
        }
    };
    serde_json::from_value(Value::Object(values)).map_err(|e| InstallError::ApplyEngine {
        module: request.module,
        reason: format!("outputs do not match the expected shape: {e}"),
    })
}

/// [`ApplyEngine`] invoking the `terragrunt` CLI.
#[derive(Debug, Clone)]
pub struct TerragruntEngine {
    program: String,
}

impl Default for TerragruntEngine {
    fn default() -> Self {
        Self {
            program: "terragrunt".to_string(),
        }
    }
}

impl TerragruntEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self, request: &ApplyRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&request.module_dir)
            .envs(&request.env)
            .env("TF_INPUT", "0")
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ApplyEngine for TerragruntEngine {
    async fn apply_module(&self, request: &ApplyRequest) -> Result<ApplyOutcome, InstallError> {
        debug!(module = %request.module, dir = %request.module_dir.display(), "Running terragrunt apply");
        let output = self
            .command(request)
            .args([
                "apply",
                "-auto-approve",
                "-input=false",
                "-no-color",
                "--terragrunt-non-interactive",
            ])
            .output()
            .await
            .map_err(|e| InstallError::ApplyEngine {
                module: request.module,
                reason: e.to_string(),
            })?;

        let mut log_output = String::from_utf8_lossy(&output.stdout).into_owned();
        log_output.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ApplyOutcome {
            success: output.status.success(),
            log_output,
        })
    }

    async fn read_module_outputs(&self, request: &ApplyRequest) -> Result<Value, InstallError> {
        let output = self
            .command(request)
            .args(["output", "-json", "--terragrunt-non-interactive"])
            .output()
            .await
            .map_err(|e| InstallError::ApplyEngine {
                module: request.module,
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(InstallError::ApplyEngine {
                module: request.module,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| InstallError::ApplyEngine {
            module: request.module,
            reason: format!("invalid output JSON: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApplyEngine;
    use serde::Deserialize;

    #[test]
    fn test_change_summary_uses_last_match() {
        let log = "Plan: 3 to add\nApply complete! Resources: 1 added, 0 changed, 0 destroyed.\n\
                   Apply complete! Resources: 4 added, 2 changed, 1 destroyed.\n";
        let summary = ChangeSummary::from_log(log).unwrap();
        assert_eq!(summary, ChangeSummary { added: 4, changed: 2, destroyed: 1 });
        assert_eq!(summary.to_string(), "+4 ~2 -1");
        assert!(ChangeSummary::from_log("No changes.").is_none());
    }

    #[test]
    fn test_request_debug_hides_env_values() {
        let request = ApplyRequest {
            module: ModuleId::KubeLinkerd,
            module_dir: PathBuf::from("/repo/kube_linkerd"),
            env: BTreeMap::from([("VAULT_TOKEN".to_string(), "hvs.secret".to_string())]),
        };
        let debug = format!("{request:?}");
        assert!(debug.contains("VAULT_TOKEN"));
        assert!(!debug.contains("hvs.secret"));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct BastionOutputs {
        bastion_domains: Vec<String>,
        bastion_port: u16,
    }

    #[tokio::test]
    async fn test_read_outputs_unwraps_values() {
        let engine = FakeApplyEngine::default();
        engine.set_outputs(
            ModuleId::KubeBastion,
            serde_json::json!({
                "bastion_domains": {"value": ["bastion.prod.example.com"], "sensitive": false},
                "bastion_port": {"value": 45459}
            }),
        );
        let request = ApplyRequest {
            module: ModuleId::KubeBastion,
            module_dir: PathBuf::from("/repo/kube_bastion"),
            env: BTreeMap::new(),
        };

        let outputs: BastionOutputs = read_outputs(&engine, &request).await.unwrap();
        assert_eq!(outputs.bastion_port, 45459);
        assert_eq!(outputs.bastion_domains, vec!["bastion.prod.example.com"]);
    }

    #[tokio::test]
    async fn test_read_outputs_rejects_wrong_shape() {
        let engine = FakeApplyEngine::default();
        engine.set_outputs(ModuleId::KubeBastion, serde_json::json!({"bastion_port": {"value": "x"}}));
        let request = ApplyRequest {
            module: ModuleId::KubeBastion,
            module_dir: PathBuf::from("/repo/kube_bastion"),
            env: BTreeMap::new(),
        };

        let result: Result<BastionOutputs, _> = read_outputs(&engine, &request).await;
        assert!(matches!(result, Err(InstallError::ApplyEngine { .. })));
    }
}
