//! Readiness checks against the cluster and public endpoints.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::config::KubeConfigOptions;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Config};
use thiserror::Error;
use tracing::debug;

/// Label modules put on the resources they own.
pub const ROOT_MODULE_LABEL: &str = "installer.io/root-module";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to load kubeconfig context {context:?}: {reason}")]
    KubeConfig {
        context: Option<String>,
        reason: String,
    },

    #[error("kubernetes API request failed")]
    Kube(#[from] kube::Error),

    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Checks the installer polls while waiting for the cluster.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Whether every pod in `namespace` is running (and at least one exists).
    async fn pods_running(&self, namespace: &str) -> Result<bool, ProbeError>;

    /// Whether every certificate created by `root_module` in `namespace` is ready.
    async fn certificates_ready(&self, namespace: &str, root_module: &str) -> Result<bool, ProbeError>;

    /// Roll every deployment in `namespace`.
    async fn restart_deployments(&self, namespace: &str) -> Result<(), ProbeError>;

    /// Whether `url` answers with a success status.
    async fn endpoint_healthy(&self, url: &str) -> Result<bool, ProbeError>;
}

/// [`ClusterProbe`] backed by the Kubernetes API and HTTP.
#[derive(Debug, Clone)]
pub struct LiveProbe {
    kube_context: Option<String>,
    http: reqwest::Client,
}

impl LiveProbe {
    #[must_use]
    pub fn new(kube_context: Option<String>) -> Self {
        Self {
            kube_context,
            http: reqwest::Client::new(),
        }
    }

    async fn client(&self) -> Result<Client, ProbeError> {
        let options = KubeConfigOptions {
            context: self.kube_context.clone(),
            ..KubeConfigOptions::default()
        };
        let config = Config::from_kubeconfig(&options)
            .await
            .map_err(|e| ProbeError::KubeConfig {
                context: self.kube_context.clone(),
                reason: e.to_string(),
            })?;
        Ok(Client::try_from(config)?)
    }
}

fn certificate_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate"))
}

/// Whether a cert-manager `Certificate` reports `Ready=True`.
fn certificate_is_ready(certificate: &DynamicObject) -> bool {
    certificate.data["status"]["conditions"]
        .as_array()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Ready" && c["status"] == "True")
        })
}

#[async_trait]
impl ClusterProbe for LiveProbe {
    async fn pods_running(&self, namespace: &str) -> Result<bool, ProbeError> {
        let pods: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let list = pods.list(&ListParams::default()).await?;
        let running = list.items.iter().all(|pod| {
            pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
        });
        debug!(namespace, pods = list.items.len(), running, "Checked pod phases");
        Ok(!list.items.is_empty() && running)
    }

    async fn certificates_ready(&self, namespace: &str, root_module: &str) -> Result<bool, ProbeError> {
        let resource = certificate_resource();
        let certificates: Api<DynamicObject> =
            Api::namespaced_with(self.client().await?, namespace, &resource);
        let selector = format!("{ROOT_MODULE_LABEL}={root_module}");
        let list = certificates
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(!list.items.is_empty() && list.items.iter().all(certificate_is_ready))
    }

    async fn restart_deployments(&self, namespace: &str) -> Result<(), ProbeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client().await?, namespace);
        for deployment in deployments.list(&ListParams::default()).await?.items {
            if let Some(name) = deployment.metadata.name.as_deref() {
                debug!(namespace, deployment = name, "Restarting deployment");
                deployments.restart(name).await?;
            }
        }
        Ok(())
    }

    async fn endpoint_healthy(&self, url: &str) -> Result<bool, ProbeError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ProbeError::Http {
                url: url.to_string(),
                source,
            })?;
        Ok(response.status().is_success())
    }
}
