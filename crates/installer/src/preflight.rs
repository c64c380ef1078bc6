//! Pre-flight checks and configuration resolution.
//!
//! Everything here runs before the first stage: missing tools, incomplete
//! configuration and unusable cloud credentials are reported as precondition
//! errors with a remediation, and nothing in the cluster is touched.

use std::path::Path;

use colored::Colorize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::config::{InstallationTarget, LayeredConfig, RegionLayout, SlaTarget};
use crate::error::InstallError;
use crate::identity::{CallerIdentity, CloudIdentity, MIN_VCPU_QUOTA};
use crate::inputs::InputShape;
use crate::prompt::Prompter;
use crate::ui;

/// Validates that the tools the installer shells out to are installed.
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    check: Box<dyn Fn() -> bool + Send + Sync>,
    install_instructions: String,
}

impl Requirement {
    fn tool(name: &'static str, install_instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            check: Box::new(move || which::which(name).is_ok()),
            install_instructions: install_instructions.to_string(),
        }
    }
}

impl PrerequisitesValidator {
    pub fn new() -> Self {
        let mut requirements = vec![
            Requirement::tool(
                "terragrunt",
                "Install Terragrunt from https://terragrunt.gruntwork.io/docs/getting-started/install/",
            ),
            Requirement::tool(
                "kubectl",
                "Install kubectl from https://kubernetes.io/docs/tasks/tools/",
            ),
            Requirement::tool(
                "aws",
                "Install the AWS CLI v2 from https://aws.amazon.com/cli/",
            ),
            Requirement::tool(
                "sops",
                "Install sops from https://github.com/getsops/sops/releases",
            ),
        ];

        // Terragrunt drives either engine.
        requirements.push(Requirement {
            name: "OpenTofu or Terraform".to_string(),
            check: Box::new(|| which::which("tofu").is_ok() || which::which("terraform").is_ok()),
            install_instructions: "Install OpenTofu from https://opentofu.org/docs/intro/install/"
                .to_string(),
        });

        Self { requirements }
    }

    /// Check every requirement and print the results.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if any requirement is not met.
    pub fn validate(&self) -> Result<(), InstallError> {
        println!();
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            let passed = (requirement.check)();
            ui::print_check_result(&requirement.name, passed, None);
            if !passed {
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
            return Ok(());
        }

        ui::print_warning("Some prerequisites are not met:");
        println!();
        for failure in &failures {
            println!(
                "  {} {} - {}",
                "✗".red(),
                failure.name,
                failure.install_instructions.bright_black()
            );
        }
        println!();

        let missing: Vec<&str> = failures.iter().map(|f| f.name.as_str()).collect();
        Err(InstallError::precondition(
            format!("Required tools are missing: {}", missing.join(", ")),
            "Install the tools listed above and try again",
        ))
    }
}

impl Default for PrerequisitesValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, InstallError> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
        InstallError::precondition(
            format!("`{key}` is not set"),
            format!("Set `{key}` in region.yaml or environment.yaml"),
        )
    })
}

/// Resolve the installation target for the region directory `dir`.
///
/// Prompts for the SLA tier and the cluster domain when they are not
/// configured yet and persists the answers to `region.yaml`.
///
/// # Errors
///
/// Returns a precondition error if `dir` is not a region directory or
/// required configuration is missing.
pub fn resolve_target(dir: &Path, prompter: &dyn Prompter) -> anyhow::Result<InstallationTarget> {
    let layout = RegionLayout::discover(dir)?;
    let config = layout.load_config()?;
    debug!(region_dir = %layout.region_dir.display(), "Loaded layered configuration");

    let environment = required(config.environment.clone(), "environment")?;
    let region = required(config.region.clone(), "region")?;
    let aws_profile = required(config.aws_profile.clone(), "aws_profile")?;
    let aws_region = required(config.aws_region.clone(), "aws_region")?;
    if config.domains.is_empty() {
        return Err(InstallError::precondition(
            "No domains are configured for this environment",
            "Add at least one entry under `domains` in environment.yaml",
        )
        .into());
    }

    let sla_target = confirm_sla_target(&layout, config.sla_target, prompter)?;
    let kube_domain = ensure_cluster_domain(&layout, &config, prompter)?;

    Ok(InstallationTarget {
        environment,
        region,
        environments_dir: layout.environments_dir,
        environment_dir: layout.environment_dir,
        region_dir: layout.region_dir,
        sla_target,
        aws_profile,
        aws_region,
        kube_context: config.kube_config_context,
        kube_domain,
        domains: config.domains,
    })
}

/// Return the configured SLA tier, asking for and persisting one when unset.
///
/// # Errors
///
/// Returns an error if the prompt fails or `region.yaml` cannot be updated.
pub fn confirm_sla_target(
    layout: &RegionLayout,
    configured: Option<SlaTarget>,
    prompter: &dyn Prompter,
) -> anyhow::Result<SlaTarget> {
    if let Some(sla_target) = configured {
        return Ok(sla_target);
    }

    let items: Vec<String> = SlaTarget::ALL
        .iter()
        .map(|tier| tier.description().to_string())
        .collect();
    let index = prompter.select("Select the SLA target for this cluster", &items, 0)?;
    let sla_target = SlaTarget::ALL
        .get(index)
        .copied()
        .unwrap_or_default();

    let mut values = Mapping::new();
    values.insert("sla_target".into(), Value::from(u8::from(sla_target)));
    layout.upsert_region_values(values)?;
    info!(sla_target = %sla_target, "Saved SLA target");
    Ok(sla_target)
}

/// Return the cluster domain, asking for and persisting one when unset.
///
/// The operator picks one of the environment's domains and a subdomain that
/// no other region already uses.
///
/// # Errors
///
/// Returns an error if the prompt fails or `region.yaml` cannot be updated.
pub fn ensure_cluster_domain(
    layout: &RegionLayout,
    config: &LayeredConfig,
    prompter: &dyn Prompter,
) -> anyhow::Result<String> {
    if let Some(domain) = config.kube_domain.as_ref().filter(|d| !d.is_empty()) {
        return Ok(domain.clone());
    }

    let domains: Vec<String> = config.domains.keys().cloned().collect();
    let parent = match domains.as_slice() {
        [only] => only.clone(),
        _ => {
            let index = prompter.select("Select the domain for this cluster", &domains, 0)?;
            domains.get(index).cloned().unwrap_or_default()
        }
    };

    let taken = layout.other_region_domains()?;
    let validate = |subdomain: &str| -> Result<(), String> {
        InputShape::Subdomain.check_str(subdomain)?;
        let candidate = format!("{subdomain}.{parent}");
        if taken.contains(&candidate) {
            return Err(format!("{candidate} is already used by another region"));
        }
        Ok(())
    };
    let subdomain = prompter.input(
        &format!("Subdomain for the cluster (<subdomain>.{parent})"),
        None,
        &validate,
    )?;

    let kube_domain = format!("{subdomain}.{parent}");
    let mut values = Mapping::new();
    values.insert("kube_domain".into(), Value::from(kube_domain.clone()));
    layout.upsert_region_values(values)?;
    info!(kube_domain = %kube_domain, "Saved cluster domain");
    Ok(kube_domain)
}

/// Check the cloud credentials and vCPU quota for the target account.
///
/// # Errors
///
/// Returns a precondition error if the identity cannot be resolved or the
/// quota is below [`MIN_VCPU_QUOTA`].
pub async fn check_cloud_account(
    identity: &dyn CloudIdentity,
    target: &InstallationTarget,
) -> Result<CallerIdentity, InstallError> {
    let caller = identity.get_identity(&target.aws_profile).await?;
    ui::print_check_result(
        "Cloud credentials",
        true,
        Some(&format!("account {}", caller.account)),
    );

    let quota = identity
        .vcpu_quota(&target.aws_profile, &target.aws_region)
        .await?;
    if quota < MIN_VCPU_QUOTA {
        ui::print_check_result("On-demand vCPU quota", false, Some(&format!("{quota}")));
        return Err(InstallError::precondition(
            format!(
                "The on-demand vCPU quota in {} is {quota}, at least {MIN_VCPU_QUOTA} is required",
                target.aws_region
            ),
            "Request a quota increase for 'Running On-Demand Standard instances' in the Service Quotas console",
        ));
    }
    ui::print_check_result("On-demand vCPU quota", true, Some(&format!("{quota}")));
    Ok(caller)
}
