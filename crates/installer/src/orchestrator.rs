//! Installer orchestration.
//!
//! Walks the stages in order. A stage whose completion predicate holds is
//! skipped; everything else runs, and the first failure stops the run with
//! all progress on disk so the next invocation resumes where this one left off.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::context::InstallContext;
use crate::modules::ModuleId;
use crate::preflight;
use crate::stages::Stage;
use crate::ui;
use crate::vault::VAULT_RECOVERY_FILE;

/// Stages a run executed and skipped, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub executed: Vec<Stage>,
    pub skipped: Vec<Stage>,
}

/// Drives one installation run.
pub struct Installer {
    ctx: InstallContext,
}

impl Installer {
    #[must_use]
    pub fn new(ctx: InstallContext) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &InstallContext {
        &self.ctx
    }

    /// Run every stage that is not complete yet.
    ///
    /// Safe to re-run after any failure or interruption: completed stages are
    /// detected from module status and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the cloud account checks fail, the run is
    /// interrupted, or a stage fails.
    pub async fn run_to_completion(&self) -> Result<InstallReport> {
        let ctx = &self.ctx;
        ctx.ensure_not_interrupted()?;

        ui::print_section("Checking the cloud account");
        let caller = preflight::check_cloud_account(ctx.identity.as_ref(), &ctx.target).await?;
        info!(account = %caller.account, arn = %caller.arn, "Resolved cloud identity");

        let checkpoint = ctx.checkpoint.load();
        info!(
            path = %ctx.checkpoint.path().display(),
            completed = checkpoint.steps.values().filter(|done| **done).count(),
            "Loaded checkpoint"
        );

        ui::print_section(&format!("Installing {}", ctx.target.cluster_key()));
        let mut report = InstallReport::default();
        let mut stage = Stage::Network;
        while stage != Stage::Done {
            ctx.ensure_not_interrupted()?;
            let predicate = stage.completion();
            let complete = predicate
                .is_complete(&ctx.target)
                .with_context(|| format!("Failed to check whether '{}' is complete", stage.description()))?;

            if complete {
                info!(stage = %stage, predicate = predicate.name(), "Stage already complete");
                ui::print_skipped(stage.step_number(), Stage::TOTAL, stage.description());
                report.skipped.push(stage);
            } else {
                ui::print_progress_step(stage.step_number(), Stage::TOTAL, stage.description());
                info!(stage = %stage, "Running stage");
                if let Err(e) = stage.run(ctx).await {
                    error!(stage = %stage, error = format!("{e:#}"), "Stage failed");
                    ui::print_error(&format!("Installation failed at '{}': {e:#}", stage.description()));
                    ui::print_info("Progress has been saved. Re-run the same command to resume.");
                    return Err(e.context(format!("Stage '{}' failed", stage.description())));
                }
                report.executed.push(stage);
            }

            if let Some(step) = stage.step_id() {
                ctx.checkpoint.set_step_complete(step)?;
            }
            stage = stage.next();
        }

        self.print_success_summary(&report);
        Ok(report)
    }

    fn print_success_summary(&self, report: &InstallReport) {
        let target = &self.ctx.target;
        ui::print_section("Installation complete");
        ui::print_kv("Cluster", &target.cluster_key());
        ui::print_kv("Kubernetes context", &target.kube_context());
        ui::print_kv("Cluster domain", &target.kube_domain);
        ui::print_kv("Vault", &format!("https://{}", target.vault_domain()));
        ui::print_kv(
            "Stages",
            &format!("{} run, {} already complete", report.executed.len(), report.skipped.len()),
        );
        println!();
        ui::print_warning(&format!(
            "Back up {} and its decryption key now; it is the only way to recover Vault",
            target
                .module_dir(ModuleId::KubeVault)
                .join(VAULT_RECOVERY_FILE)
                .display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StepId;
    use crate::error::InstallError;
    use crate::inputs;
    use crate::stages::SELF_GENERATED_CERTS_INPUT;
    use crate::status::{self, update_module_status, DeployStatus, InitStatus};
    use crate::testing::{self, Fakes, FakeIdentity};

    fn mark_deployed(target: &crate::config::InstallationTarget, module: ModuleId) {
        let dir = target.module_dir(module);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("terragrunt.hcl"), "# existing\n").unwrap();
        update_module_status(&dir, Some(InitStatus::Success), Some(DeployStatus::Success)).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_install_runs_every_stage() {
        let (_dir, target) = testing::target();
        let fakes = Fakes::default();
        let installer = Installer::new(fakes.context(&target));

        let report = installer.run_to_completion().await.unwrap();

        assert_eq!(report.executed, Stage::ORDER.to_vec());
        assert!(report.skipped.is_empty());
        for module in ModuleId::ALL {
            assert!(status::get_status(&target, module).is_deployed(), "{module} not deployed");
        }
        let checkpoint = installer.context().checkpoint.snapshot();
        for stage in Stage::ORDER {
            let step = stage.step_id().unwrap();
            assert_eq!(checkpoint.steps.get(&step), Some(&true), "{step:?} not recorded");
        }
        for step in [
            StepId::VaultInitialized,
            StepId::VaultAddressPersisted,
            StepId::BastionConnectivity,
        ] {
            assert_eq!(checkpoint.steps.get(&step), Some(&true), "{step:?} not recorded");
        }
        assert_eq!(fakes.proxies.started(), fakes.proxies.stopped());
        assert!(!fakes.proxies.started().is_empty());

        let eks = target.module_dir(ModuleId::AwsEks);
        assert_eq!(inputs::read_flag(&eks, "bootstrap_mode_enabled").unwrap(), Some(false));
        let cert_manager = target.module_dir(ModuleId::KubeCertManager);
        assert_eq!(
            inputs::read_flag(&cert_manager, SELF_GENERATED_CERTS_INPUT).unwrap(),
            Some(false)
        );
        let checked = fakes.probe.certificate_checks();
        assert!(checked.iter().any(|m| m == "kube_cert_issuers"), "{checked:?}");
        assert!(checked.iter().any(|m| m == "kube_ingress_nginx"), "{checked:?}");
        let connection_info = std::fs::read_to_string(target.ssh_dir().join("connection_info.yaml")).unwrap();
        assert!(connection_info.contains("production-us-east-1"));
    }

    #[tokio::test]
    async fn test_second_run_applies_nothing() {
        let (_dir, target) = testing::target();
        let fakes = Fakes::default();
        Installer::new(fakes.context(&target))
            .run_to_completion()
            .await
            .unwrap();
        let applied_first = fakes.apply.applied().len();

        let rerun = fakes.rerun();
        let report = Installer::new(rerun.context(&target))
            .run_to_completion()
            .await
            .unwrap();

        assert!(applied_first > 0);
        assert!(rerun.apply.applied().is_empty(), "{:?}", rerun.apply.applied());
        assert_eq!(report.executed, vec![Stage::ClusterExtensions]);
        assert_eq!(report.skipped.len(), Stage::ORDER.len() - 1);
        assert_eq!(rerun.vault.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_resumes_after_existing_control_plane() {
        let (_dir, target) = testing::target();
        mark_deployed(&target, ModuleId::AwsVpc);
        mark_deployed(&target, ModuleId::AwsEks);
        let fakes = Fakes::default();

        let report = Installer::new(fakes.context(&target))
            .run_to_completion()
            .await
            .unwrap();

        assert_eq!(report.skipped, vec![Stage::Network, Stage::ClusterControlPlane]);
        assert_eq!(fakes.apply.applied().first(), Some(&ModuleId::KubeCilium));
    }

    #[tokio::test]
    async fn test_certificates_rerun_while_self_generated() {
        let (_dir, target) = testing::target();
        let fakes = Fakes::default();
        Installer::new(fakes.context(&target))
            .run_to_completion()
            .await
            .unwrap();

        let cert_manager = target.module_dir(ModuleId::KubeCertManager);
        inputs::apply_overrides(
            ModuleId::KubeCertManager,
            &cert_manager,
            &[inputs::InputOverride::set(
                SELF_GENERATED_CERTS_INPUT,
                inputs::InputShape::Bool,
                true,
            )],
        )
        .unwrap();

        let rerun = fakes.rerun();
        let report = Installer::new(rerun.context(&target))
            .run_to_completion()
            .await
            .unwrap();

        assert_eq!(report.executed, vec![Stage::Certificates, Stage::ClusterExtensions]);
        assert_eq!(rerun.apply.applied(), vec![ModuleId::KubeCertManager]);
        assert_eq!(
            inputs::read_flag(&cert_manager, SELF_GENERATED_CERTS_INPUT).unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_failed_apply_resumes_at_failed_module() {
        let (_dir, target) = testing::target();
        let fakes = Fakes::default();
        fakes.apply.fail(ModuleId::KubeLinkerd);

        let err = Installer::new(fakes.context(&target))
            .run_to_completion()
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Deploying the service mesh"), "{message}");
        assert!(message.contains("kube_linkerd"), "{message}");
        assert!(!status::get_status(&target, ModuleId::KubeLinkerd).is_deployed());
        assert_eq!(fakes.proxies.started(), fakes.proxies.stopped());

        let rerun = fakes.rerun();
        let report = Installer::new(rerun.context(&target))
            .run_to_completion()
            .await
            .unwrap();
        assert_eq!(report.executed.first(), Some(&Stage::ServiceMesh));
        assert_eq!(rerun.apply.applied().first(), Some(&ModuleId::KubeLinkerd));
        assert!(!rerun.apply.applied().contains(&ModuleId::KubeCertIssuers));
        assert_eq!(rerun.vault.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_run_changes_nothing() {
        let (_dir, target) = testing::target();
        let fakes = Fakes::default();
        let ctx = fakes.context(&target);
        ctx.cancel.cancel();

        let err = Installer::new(ctx).run_to_completion().await.unwrap_err();

        assert!(matches!(err.downcast_ref::<InstallError>(), Some(InstallError::Interrupted)));
        assert!(fakes.apply.applied().is_empty());
    }

    #[tokio::test]
    async fn test_low_quota_stops_before_any_apply() {
        let (_dir, target) = testing::target();
        let fakes = Fakes {
            identity: std::sync::Arc::new(FakeIdentity::with_quota(8.0)),
            ..Fakes::default()
        };

        let err = Installer::new(fakes.context(&target))
            .run_to_completion()
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::Precondition { .. })
        ));
        assert!(fakes.apply.applied().is_empty());
    }
}
