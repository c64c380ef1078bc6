//! Cloud identity and quota checks run before any stage.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::InstallError;

/// Smallest on-demand vCPU quota a cluster can be bootstrapped with.
pub const MIN_VCPU_QUOTA: f64 = 16.0;
/// Service Quotas code for "Running On-Demand Standard instances".
pub const VCPU_QUOTA_CODE: &str = "L-1216C47A";

/// Caller identity as reported by STS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// Cloud account checks.
#[async_trait]
pub trait CloudIdentity: Send + Sync {
    /// Resolve the identity behind `profile`.
    async fn get_identity(&self, profile: &str) -> Result<CallerIdentity, InstallError>;

    /// On-demand vCPU quota for `profile` in `region`.
    async fn vcpu_quota(&self, profile: &str, region: &str) -> Result<f64, InstallError>;
}

/// [`CloudIdentity`] backed by the `aws` CLI.
#[derive(Debug, Clone, Default)]
pub struct AwsCli;

impl AwsCli {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<Vec<u8>, InstallError> {
        debug!(args = ?args, "Running aws");
        let output = Command::new("aws")
            .args(args)
            .args(["--output", "json"])
            .output()
            .await
            .map_err(|e| InstallError::precondition(
                format!("Failed to run the aws CLI: {e}"),
                "Install the AWS CLI v2 and make sure it is on PATH",
            ))?;
        if !output.status.success() {
            return Err(InstallError::precondition(
                format!(
                    "aws {} failed: {}",
                    args.first().copied().unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                "Check that the AWS profile is configured and logged in (aws sso login --profile <profile>)",
            ));
        }
        Ok(output.stdout)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QuotaResponse {
    quota: QuotaValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QuotaValue {
    value: f64,
}

fn unexpected(what: &str, e: &serde_json::Error) -> InstallError {
    InstallError::precondition(
        format!("Unexpected {what} response from the aws CLI: {e}"),
        "Upgrade the AWS CLI to v2",
    )
}

#[async_trait]
impl CloudIdentity for AwsCli {
    async fn get_identity(&self, profile: &str) -> Result<CallerIdentity, InstallError> {
        let stdout = Self::run(&["sts", "get-caller-identity", "--profile", profile]).await?;
        serde_json::from_slice(&stdout).map_err(|e| unexpected("identity", &e))
    }

    async fn vcpu_quota(&self, profile: &str, region: &str) -> Result<f64, InstallError> {
        let stdout = Self::run(&[
            "service-quotas",
            "get-service-quota",
            "--service-code",
            "ec2",
            "--quota-code",
            VCPU_QUOTA_CODE,
            "--profile",
            profile,
            "--region",
            region,
        ])
        .await?;
        let response: QuotaResponse =
            serde_json::from_slice(&stdout).map_err(|e| unexpected("quota", &e))?;
        Ok(response.quota.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_sts_response() {
        let identity: CallerIdentity = serde_json::from_str(
            r#"{"UserId": "AIDA123", "Account": "123456789012", "Arn": "arn:aws:iam::123456789012:user/ops"}"#,
        )
        .unwrap();
        assert_eq!(identity.account, "123456789012");
        assert!(identity.arn.ends_with("user/ops"));
    }

    #[test]
    fn test_parses_quota_response() {
        let response: QuotaResponse = serde_json::from_str(
            r#"{"Quota": {"QuotaCode": "L-1216C47A", "Value": 32.0, "Unit": "None"}}"#,
        )
        .unwrap();
        assert!((response.quota.value - 32.0).abs() < f64::EPSILON);
    }
}
