//! Certificate management.
//!
//! cert-manager first runs with self-generated certificates so the issuers can
//! be deployed; once the ingress certificate is issued, cert-manager is applied
//! again with self-generated certificates turned off.

use anyhow::{Context, Result};
use serde_yaml::Value;

use super::SELF_GENERATED_CERTS_INPUT;
use crate::checkpoint::InputKey;
use crate::context::InstallContext;
use crate::deploy::ModuleDeployment;
use crate::error::InstallError;
use crate::inputs::{self, InputOverride, InputShape};
use crate::modules::ModuleId;
use crate::proxy::with_proxy;
use crate::secrets::Sensitive;

const CERT_MANAGER_NAMESPACE: &str = "cert-manager";

/// Alert address already configured on the issuers, else saved or prompted.
fn alert_email(ctx: &InstallContext) -> Result<String> {
    let existing = inputs::read_extra_inputs(&ctx.target.module_dir(ModuleId::KubeCertIssuers))?;
    if let Some(email) = existing.get("alert_email").and_then(Value::as_str) {
        return Ok(email.to_string());
    }
    ctx.saved_or_prompt(
        InputKey::AlertEmail,
        "Email that receives certificate renewal failure alerts",
        None,
    )
}

/// Wait for the certificates issued for `root_module`, restarting
/// cert-manager after every miss but the last.
pub(super) async fn wait_for_certificates(ctx: &InstallContext, root_module: ModuleId) -> Result<(), InstallError> {
    let probe = ctx.probe.as_ref();
    let spec = ctx.polls.certificate_ready;
    let mut checks = 0;
    ctx.poller(&format!("the {root_module} certificates to be issued"), spec)
        .run(|| {
            checks += 1;
            let last = checks >= spec.max_attempts;
            async move {
                if probe.certificates_ready(CERT_MANAGER_NAMESPACE, root_module.dir_name()).await? {
                    return anyhow::Ok(true);
                }
                if !last {
                    probe.restart_deployments(CERT_MANAGER_NAMESPACE).await?;
                }
                anyhow::Ok(false)
            }
        })
        .await?;
    Ok(())
}

pub(super) async fn run(ctx: &InstallContext) -> Result<()> {
    let alert_email = alert_email(ctx)?;
    let zones = serde_yaml::to_value(&ctx.target.domains).context("Failed to serialize DNS zones")?;
    let token = ctx.root_token().await?;

    with_proxy(
        ctx.proxies.as_ref(),
        &ctx.vault_proxy(token.clone(), "deploying certificate management"),
        |endpoint| async move {
            let address = Sensitive::new(endpoint.address());
            let with_vault = |deployment: ModuleDeployment| {
                deployment
                    .with_env("VAULT_ADDR", address.clone())
                    .with_env("VAULT_TOKEN", token.clone())
            };

            ctx.deploy(with_vault(
                ctx.module(ModuleId::KubeCertManager)?
                    .with_title("Deploy cert-manager")
                    .with_input(InputOverride::set(SELF_GENERATED_CERTS_INPUT, InputShape::Bool, true)),
            ))
            .await?;

            ctx.deploy(with_vault(
                ctx.module(ModuleId::KubeCertIssuers)?
                    .with_title("Deploy certificate issuers")
                    .with_input(InputOverride::set("alert_email", InputShape::Email, alert_email))
                    .with_input(InputOverride::set("route53_zones", InputShape::StringMap, zones))
                    .with_input(InputOverride::set(
                        "kube_domain",
                        InputShape::Domain,
                        ctx.target.kube_domain.clone(),
                    )),
            ))
            .await?;

            ctx.ensure_not_interrupted()?;
            wait_for_certificates(ctx, ModuleId::KubeCertIssuers).await?;

            ctx.deploy(with_vault(
                ctx.module(ModuleId::KubeCertManager)?
                    .with_title("Deploy the first certificate")
                    .with_input(InputOverride::set(SELF_GENERATED_CERTS_INPUT, InputShape::Bool, false))
                    .skip_if_already_applied(false),
            ))
            .await?;
            anyhow::Ok(())
        },
    )
    .await
}
