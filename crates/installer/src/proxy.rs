//! Local proxy to the in-cluster Vault service.
//!
//! Modules that configure Vault need to reach it before it has a public
//! address, so the installer port-forwards the active Vault service to a
//! local port for the duration of a stage. [`with_proxy`] scopes the process
//! to a closure and always stops it afterwards.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::poll::{PollSpec, Poller};
use crate::secrets::Sensitive;

/// First local port tried for a proxy.
pub const BASE_PROXY_PORT: u16 = 8200;
const PORT_SEARCH_RANGE: u16 = 200;

/// What to forward and with which credential.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kube_context: String,
    pub namespace: String,
    pub service: String,
    pub remote_port: u16,
    /// Short-lived credential exported to the proxy process.
    pub token: Sensitive,
    /// Why the proxy is needed; used in error messages.
    pub purpose: String,
}

impl ProxyConfig {
    /// Proxy to the active Vault instance.
    pub fn vault(kube_context: impl Into<String>, token: Sensitive, purpose: impl Into<String>) -> Self {
        Self {
            kube_context: kube_context.into(),
            namespace: "vault".to_string(),
            service: "svc/vault-active".to_string(),
            remote_port: 8200,
            token,
            purpose: purpose.into(),
        }
    }
}

/// A running proxy process. Killed when dropped.
#[derive(Debug)]
pub struct ProxyHandle {
    pid: u32,
    port: u16,
    child: Option<Child>,
}

impl ProxyHandle {
    /// Handle for a process the launcher tracks itself.
    #[must_use]
    pub fn new(pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            child: None,
        }
    }

    fn with_child(child: Child, pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            child: Some(child),
        }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            pid: self.pid,
            port: self.port,
        }
    }
}

/// Borrowed view of a running proxy handed to scoped work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub pid: u32,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Address clients should use, e.g. as `VAULT_ADDR`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Starts and stops proxy processes.
#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    /// Start a proxy and wait until it accepts connections.
    async fn start(&self, config: &ProxyConfig) -> Result<ProxyHandle, InstallError>;

    /// Stop a proxy. Must tolerate processes that already exited and never fail.
    async fn stop(&self, handle: ProxyHandle);
}

/// Run `body` with a proxy that is stopped on every exit path.
///
/// Early returns and errors inside `body` stop the proxy through `stop`;
/// panics and cancellation drop the handle, which kills the process.
///
/// # Errors
///
/// Returns the start failure, or whatever `body` returns.
pub async fn with_proxy<T, F, Fut>(
    launcher: &dyn ProxyLauncher,
    config: &ProxyConfig,
    body: F,
) -> Result<T>
where
    F: FnOnce(ProxyEndpoint) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = launcher.start(config).await?;
    let endpoint = handle.endpoint();
    info!(pid = endpoint.pid, port = endpoint.port, "Started Vault proxy for {}", config.purpose);

    let result = body(endpoint).await;

    launcher.stop(handle).await;
    debug!(pid = endpoint.pid, "Stopped Vault proxy");
    result
}

/// [`ProxyLauncher`] running `kubectl port-forward`.
#[derive(Debug)]
pub struct KubectlProxyLauncher {
    base_port: u16,
    readiness: PollSpec,
    reserved: Mutex<BTreeSet<u16>>,
}

impl KubectlProxyLauncher {
    #[must_use]
    pub fn new(readiness: PollSpec) -> Self {
        Self {
            base_port: BASE_PROXY_PORT,
            readiness,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// Claim a free local port not already handed to another proxy.
    fn reserve_port(&self) -> Option<u16> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let last = self.base_port.saturating_add(PORT_SEARCH_RANGE);
        let port = (self.base_port..last).find(|port| {
            !reserved.contains(port) && TcpListener::bind((Ipv4Addr::LOCALHOST, *port)).is_ok()
        })?;
        reserved.insert(port);
        Some(port)
    }

    fn release_port(&self, port: u16) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    async fn wait_until_listening(&self, child: &mut Child, port: u16) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Poller::new(format!("proxy on port {port}"), self.readiness)
            .run(|| {
                let exited = child.try_wait();
                async move {
                    if let Ok(Some(status)) = exited {
                        anyhow::bail!("port-forward exited early with {status}");
                    }
                    Ok(TcpStream::connect(addr).await.is_ok())
                }
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyLauncher for KubectlProxyLauncher {
    async fn start(&self, config: &ProxyConfig) -> Result<ProxyHandle, InstallError> {
        let start_err = |reason: String| InstallError::ProxyStart {
            purpose: config.purpose.clone(),
            reason,
        };
        let port = self
            .reserve_port()
            .ok_or_else(|| start_err(format!("no free local port at or above {}", self.base_port)))?;

        let spawned = Command::new("kubectl")
            .args(["port-forward", "--address", "127.0.0.1", "-n", config.namespace.as_str()])
            .args(["--context", config.kube_context.as_str()])
            .arg(&config.service)
            .arg(format!("{port}:{}", config.remote_port))
            .env("VAULT_TOKEN", config.token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.release_port(port);
                return Err(start_err(format!("failed to run kubectl: {e}")));
            }
        };
        let Some(pid) = child.id() else {
            self.release_port(port);
            return Err(start_err("port-forward exited immediately".to_string()));
        };

        if let Err(e) = self.wait_until_listening(&mut child, port).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.release_port(port);
            return Err(start_err(format!("{e:#}")));
        }

        debug!(pid, port, "Proxy is accepting connections");
        Ok(ProxyHandle::with_child(child, pid, port))
    }

    async fn stop(&self, mut handle: ProxyHandle) {
        if let Some(mut child) = handle.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => debug!(pid = handle.pid, "Proxy already exited"),
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid = handle.pid, error = %e, "Failed to signal Vault proxy");
                    }
                    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(pid = handle.pid, error = %e, "Failed to reap Vault proxy"),
                        Err(_) => warn!(pid = handle.pid, "Vault proxy did not exit within 5s"),
                    }
                }
            }
        }
        self.release_port(handle.port);
    }
}
