//! Module deployment task.
//!
//! A [`ModuleDeployment`] describes one module apply: optional scaffolding,
//! input overrides written before the apply, and input overrides written only
//! after a confirmed success. A module the oracle reports deployed is left
//! untouched.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::apply::{ApplyEngine, ApplyRequest, ChangeSummary};
use crate::config::InstallationTarget;
use crate::error::InstallError;
use crate::files;
use crate::inputs::{self, InputOverride, MODULE_HCL_FILE};
use crate::modules::ModuleId;
use crate::secrets::Sensitive;
use crate::status::{self, DeployStatus, InitStatus};

/// Lines of engine output kept in apply errors.
const ERROR_TAIL_LINES: usize = 40;

/// What happened when a deployment ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The module was already deployed and skipping was allowed.
    Skipped,
    /// The module was applied.
    Applied(Option<ChangeSummary>),
}

/// Declarative description of one module deployment.
#[derive(Debug, Clone)]
pub struct ModuleDeployment {
    module: ModuleId,
    title: String,
    template_if_missing: Option<String>,
    input_overrides: Vec<InputOverride>,
    post_deploy_overrides: Vec<InputOverride>,
    skip_if_already_applied: bool,
    env: BTreeMap<String, Sensitive>,
}

impl ModuleDeployment {
    pub fn new(module: ModuleId) -> Self {
        Self {
            module,
            title: format!("Deploy {module}"),
            template_if_missing: None,
            input_overrides: Vec::new(),
            post_deploy_overrides: Vec::new(),
            skip_if_already_applied: true,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Scaffold `terragrunt.hcl` from `template` when it does not exist.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template_if_missing = Some(template.into());
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: InputOverride) -> Self {
        self.input_overrides.push(input);
        self
    }

    /// Override written only after the apply succeeded.
    #[must_use]
    pub fn with_post_deploy_input(mut self, input: InputOverride) -> Self {
        self.post_deploy_overrides.push(input);
        self
    }

    #[must_use]
    pub fn skip_if_already_applied(mut self, skip: bool) -> Self {
        self.skip_if_already_applied = skip;
        self
    }

    /// Environment variable passed to the apply engine.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: Sensitive) -> Self {
        self.env.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Run the deployment.
    ///
    /// # Errors
    ///
    /// Returns a validation error before touching anything when an override is
    /// invalid, and [`InstallError::Apply`] when the apply fails.
    pub async fn run(
        &self,
        target: &InstallationTarget,
        engine: &dyn ApplyEngine,
    ) -> Result<DeployOutcome, InstallError> {
        let module = self.module;
        let module_dir = target.module_dir(module);
        let hcl_path = module_dir.join(MODULE_HCL_FILE);

        // Everything is validated before the first write.
        let existing_hcl = files::read_optional(&hcl_path)?;
        let hcl = match (&existing_hcl, &self.template_if_missing) {
            (Some(hcl), _) | (None, Some(hcl)) => hcl.as_str(),
            (None, None) => {
                return Err(InstallError::MissingModule {
                    module,
                    path: hcl_path,
                })
            }
        };
        inputs::check_conflicts(module, &hcl_path, hcl, &self.input_overrides)?;
        inputs::check_conflicts(module, &hcl_path, hcl, &self.post_deploy_overrides)?;
        let validated = inputs::validate_overrides(module, &module_dir, &self.input_overrides)?;

        // Queried before scaffolding: a fresh directory without a record reads as deployed.
        // A skipped module keeps its inputs, including any post-deploy values.
        if self.skip_if_already_applied && status::get_status(target, module).is_deployed() {
            debug!(module = %module, "Module already deployed, skipping");
            return Ok(DeployOutcome::Skipped);
        }

        if existing_hcl.is_none() {
            info!(module = %module, "Scaffolding module configuration");
            files::write_atomic(&hcl_path, hcl.as_bytes())?;
            status::update_module_status(
                &module_dir,
                Some(InitStatus::Uninited),
                Some(DeployStatus::Undeployed),
            )?;
        }
        inputs::write_overrides(&module_dir, &validated)?;

        status::update_module_status(&module_dir, None, Some(DeployStatus::Running))?;
        let request = ApplyRequest {
            module,
            module_dir: module_dir.clone(),
            env: self
                .env
                .iter()
                .map(|(name, value)| (name.clone(), value.expose().to_string()))
                .collect(),
        };

        let outcome = match engine.apply_module(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                mark_failed(&module_dir, module);
                return Err(err);
            }
        };
        if !outcome.success {
            mark_failed(&module_dir, module);
            debug!(module = %module, "Apply output:\n{}", outcome.log_output);
            return Err(InstallError::Apply {
                module,
                output: tail(&outcome.log_output, ERROR_TAIL_LINES),
            });
        }

        status::update_module_status(
            &module_dir,
            Some(InitStatus::Success),
            Some(DeployStatus::Success),
        )?;
        let summary = ChangeSummary::from_log(&outcome.log_output);
        info!(module = %module, changes = ?summary, "Module deployed");

        if !self.post_deploy_overrides.is_empty() {
            inputs::apply_overrides(module, &module_dir, &self.post_deploy_overrides)?;
        }

        Ok(DeployOutcome::Applied(summary))
    }
}

fn mark_failed(module_dir: &std::path::Path, module: ModuleId) {
    if let Err(e) = status::update_module_status(module_dir, None, Some(DeployStatus::Error)) {
        warn!(module = %module, error = %e, "Failed to record module failure");
    }
}

fn tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
