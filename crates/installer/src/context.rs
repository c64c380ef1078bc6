//! Everything a stage needs, bundled once per run.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::apply::ApplyEngine;
use crate::checkpoint::{CheckpointStore, InputKey};
use crate::config::{InstallationTarget, PollSettings};
use crate::deploy::{DeployOutcome, ModuleDeployment};
use crate::error::InstallError;
use crate::identity::CloudIdentity;
use crate::modules::ModuleId;
use crate::poll::{PollSpec, Poller};
use crate::probe::ClusterProbe;
use crate::prompt::Prompter;
use crate::proxy::{ProxyConfig, ProxyLauncher};
use crate::secrets::{SecretStore, Sensitive};
use crate::templates;
use crate::ui;
use crate::vault::{self, RecoveryScheme, SecretsBackend};

/// Shared state and collaborators for one installer run.
pub struct InstallContext {
    pub target: InstallationTarget,
    pub apply: Arc<dyn ApplyEngine>,
    pub proxies: Arc<dyn ProxyLauncher>,
    pub vault: Arc<dyn SecretsBackend>,
    pub secrets: Arc<dyn SecretStore>,
    pub identity: Arc<dyn CloudIdentity>,
    pub probe: Arc<dyn ClusterProbe>,
    pub prompter: Arc<dyn Prompter>,
    pub checkpoint: CheckpointStore,
    pub polls: PollSettings,
    pub recovery: RecoveryScheme,
    pub cancel: CancellationToken,
}

impl InstallContext {
    /// Fail with [`InstallError::Interrupted`] once the run was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Interrupted`] after cancellation.
    pub fn ensure_not_interrupted(&self) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Interrupted);
        }
        Ok(())
    }

    /// Deployment of `module` that scaffolds the default template when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be rendered.
    pub fn module(&self, module: ModuleId) -> Result<ModuleDeployment, InstallError> {
        Ok(ModuleDeployment::new(module).with_template(templates::module_template(&self.target, module)?))
    }

    /// Run a deployment, honouring cancellation first.
    ///
    /// # Errors
    ///
    /// Returns the deployment failure with the module named in the context.
    pub async fn deploy(&self, deployment: ModuleDeployment) -> Result<DeployOutcome> {
        self.ensure_not_interrupted()?;
        let module = deployment.module();
        let outcome = deployment
            .run(&self.target, self.apply.as_ref())
            .await
            .with_context(|| format!("Failed to deploy {module}"))?;
        match outcome {
            DeployOutcome::Skipped => ui::print_progress(&format!("{} (already deployed)", deployment.title())),
            DeployOutcome::Applied(Some(changes)) => {
                ui::print_progress(&format!("{} ({changes})", deployment.title()));
            }
            DeployOutcome::Applied(None) => ui::print_progress(deployment.title()),
        }
        Ok(outcome)
    }

    /// Bounded wait with cancellation and a spinner.
    pub fn poller(&self, description: &str, spec: PollSpec) -> Poller<'_> {
        Poller::new(description, spec)
            .with_cancel(&self.cancel)
            .with_spinner()
    }

    /// Proxy to Vault authenticated with `token`.
    #[must_use]
    pub fn vault_proxy(&self, token: Sensitive, purpose: &str) -> ProxyConfig {
        ProxyConfig::vault(self.target.kube_context(), token, purpose)
    }

    /// Root token stored by the Vault ritual.
    ///
    /// # Errors
    ///
    /// Returns an error if the token was never stored or cannot be decrypted.
    pub async fn root_token(&self) -> Result<Sensitive, InstallError> {
        vault::load_root_token(self.secrets.as_ref(), &self.target.module_dir(ModuleId::KubeVault)).await
    }

    /// Saved answer for `key`, or ask the operator and save the answer.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt fails or the answer cannot be saved.
    pub fn saved_or_prompt(&self, key: InputKey, prompt: &str, default: Option<&str>) -> Result<String> {
        if let Some(saved) = self.checkpoint.get_saved_input(key) {
            info!(input = %key, "Reusing saved answer");
            return Ok(saved);
        }
        let shape = key.shape();
        let answer = self
            .prompter
            .input(prompt, default, &|text| shape.check_str(text))?;
        self.checkpoint.update_saved_input(key, answer.clone())?;
        Ok(answer)
    }
}
