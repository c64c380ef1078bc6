//! In-memory collaborators and fixtures for tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use serde_yaml::Mapping;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::apply::{ApplyEngine, ApplyOutcome, ApplyRequest};
use crate::checkpoint::CheckpointStore;
use crate::config::{DomainConfig, InstallationTarget, PollSettings, SlaTarget, CHECKPOINT_FILE};
use crate::context::InstallContext;
use crate::error::InstallError;
use crate::identity::{CallerIdentity, CloudIdentity};
use crate::modules::ModuleId;
use crate::poll::PollSpec;
use crate::probe::{ClusterProbe, ProbeError};
use crate::prompt::{Prompter, Validator};
use crate::proxy::{ProxyConfig, ProxyHandle, ProxyLauncher};
use crate::secrets::{SecretStore, Sensitive};
use crate::vault::{RecoveryMaterial, RecoveryScheme, SealStatus, SecretsBackend};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// A `production/us-east-1` region directory with its configuration files.
pub fn target() -> (TempDir, InstallationTarget) {
    let dir = TempDir::new().unwrap();
    let environments_dir = dir.path().join("environments");
    let environment_dir = environments_dir.join("production");
    let region_dir = environment_dir.join("us-east-1");
    std::fs::create_dir_all(&region_dir).unwrap();
    std::fs::write(
        environment_dir.join("environment.yaml"),
        "environment: production\naws_profile: prod\ndomains:\n  example.com:\n    zone_id: Z0123456789\n    record_manager_role_arn: arn:aws:iam::123456789012:role/dns\n",
    )
    .unwrap();
    std::fs::write(
        region_dir.join("region.yaml"),
        "region: us-east-1\naws_region: us-east-1\nsla_target: 1\nkube_domain: prod.example.com\n",
    )
    .unwrap();

    let target = InstallationTarget {
        environment: "production".to_string(),
        region: "us-east-1".to_string(),
        environments_dir,
        environment_dir,
        region_dir,
        sla_target: SlaTarget::One,
        aws_profile: "prod".to_string(),
        aws_region: "us-east-1".to_string(),
        kube_context: None,
        kube_domain: "prod.example.com".to_string(),
        domains: BTreeMap::from([(
            "example.com".to_string(),
            DomainConfig {
                zone_id: "Z0123456789".to_string(),
                record_manager_role_arn: "arn:aws:iam::123456789012:role/dns".to_string(),
            },
        )]),
    };
    (dir, target)
}

/// Records applies; every module succeeds unless told to fail.
#[derive(Debug)]
pub struct FakeApplyEngine {
    applied: Mutex<Vec<ModuleId>>,
    failing: Mutex<BTreeSet<ModuleId>>,
    outputs: Mutex<BTreeMap<ModuleId, serde_json::Value>>,
    envs: Mutex<BTreeMap<ModuleId, BTreeMap<String, String>>>,
}

impl Default for FakeApplyEngine {
    fn default() -> Self {
        let outputs = BTreeMap::from([(
            ModuleId::KubeBastion,
            json!({
                "bastion_domains": {"value": ["bastion.prod.example.com"]},
                "bastion_port": {"value": 45459}
            }),
        )]);
        Self {
            applied: Mutex::default(),
            failing: Mutex::default(),
            outputs: Mutex::new(outputs),
            envs: Mutex::default(),
        }
    }
}

impl FakeApplyEngine {
    /// Modules applied successfully, in order.
    pub fn applied(&self) -> Vec<ModuleId> {
        lock(&self.applied).clone()
    }

    pub fn fail(&self, module: ModuleId) {
        lock(&self.failing).insert(module);
    }

    pub fn heal(&self, module: ModuleId) {
        lock(&self.failing).remove(&module);
    }

    pub fn set_outputs(&self, module: ModuleId, outputs: serde_json::Value) {
        lock(&self.outputs).insert(module, outputs);
    }

    /// Environment passed to the last apply of `module`.
    pub fn env_for(&self, module: ModuleId) -> BTreeMap<String, String> {
        lock(&self.envs).get(&module).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ApplyEngine for FakeApplyEngine {
    async fn apply_module(&self, request: &ApplyRequest) -> Result<ApplyOutcome, InstallError> {
        lock(&self.envs).insert(request.module, request.env.clone());
        if lock(&self.failing).contains(&request.module) {
            return Ok(ApplyOutcome {
                success: false,
                log_output: format!("Error: simulated failure applying {}", request.module),
            });
        }
        lock(&self.applied).push(request.module);
        Ok(ApplyOutcome {
            success: true,
            log_output: "Apply complete! Resources: 1 added, 0 changed, 0 destroyed.".to_string(),
        })
    }

    async fn read_module_outputs(&self, request: &ApplyRequest) -> Result<serde_json::Value, InstallError> {
        lock(&self.outputs)
            .get(&request.module)
            .cloned()
            .ok_or_else(|| InstallError::ApplyEngine {
                module: request.module,
                reason: "no outputs".to_string(),
            })
    }
}

/// Hands out fake process ids and records every start and stop.
#[derive(Debug, Default)]
pub struct FakeProxyLauncher {
    fail_start: bool,
    next_pid: AtomicU32,
    started: Mutex<Vec<u32>>,
    stopped: Mutex<Vec<u32>>,
}

impl FakeProxyLauncher {
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<u32> {
        lock(&self.started).clone()
    }

    pub fn stopped(&self) -> Vec<u32> {
        lock(&self.stopped).clone()
    }
}

#[async_trait]
impl ProxyLauncher for FakeProxyLauncher {
    async fn start(&self, config: &ProxyConfig) -> Result<ProxyHandle, InstallError> {
        if self.fail_start {
            return Err(InstallError::ProxyStart {
                purpose: config.purpose.clone(),
                reason: "port-forward refused".to_string(),
            });
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        lock(&self.started).push(pid);
        Ok(ProxyHandle::new(pid, 18200))
    }

    async fn stop(&self, handle: ProxyHandle) {
        lock(&self.stopped).push(handle.pid());
    }
}

#[derive(Debug, Default)]
struct VaultState {
    initialized: bool,
    sealed: bool,
    threshold: u8,
    progress: u8,
    init_calls: usize,
    unseal_calls: usize,
}

/// Vault that unseals once `threshold` shares were submitted.
#[derive(Debug)]
pub struct FakeVault {
    state: Mutex<VaultState>,
    never_unseals: bool,
}

impl FakeVault {
    pub fn uninitialized() -> Self {
        Self {
            state: Mutex::new(VaultState {
                sealed: true,
                ..VaultState::default()
            }),
            never_unseals: false,
        }
    }

    pub fn initialized_sealed() -> Self {
        Self {
            state: Mutex::new(VaultState {
                initialized: true,
                sealed: true,
                threshold: 1,
                ..VaultState::default()
            }),
            never_unseals: false,
        }
    }

    #[must_use]
    pub fn never_unseals(mut self) -> Self {
        self.never_unseals = true;
        self
    }

    /// Seal again, as after a pod restart.
    pub fn reseal(&self) {
        let mut state = lock(&self.state);
        state.sealed = true;
        state.progress = 0;
    }

    pub fn init_calls(&self) -> usize {
        lock(&self.state).init_calls
    }

    pub fn unseal_calls(&self) -> usize {
        lock(&self.state).unseal_calls
    }
}

#[async_trait]
impl SecretsBackend for FakeVault {
    async fn status(&self) -> Result<SealStatus, InstallError> {
        let state = lock(&self.state);
        Ok(SealStatus {
            initialized: state.initialized,
            sealed: state.sealed,
        })
    }

    async fn initialize(&self, scheme: RecoveryScheme) -> Result<RecoveryMaterial, InstallError> {
        let mut state = lock(&self.state);
        state.init_calls += 1;
        if state.initialized {
            return Err(InstallError::Vault {
                operation: "initialize",
                reason: "Vault is already initialized".to_string(),
            });
        }
        state.initialized = true;
        state.sealed = true;
        state.threshold = scheme.threshold;
        state.progress = 0;
        Ok(RecoveryMaterial {
            root_token: Sensitive::new("hvs.fake-root-token"),
            shares: (0..scheme.shares)
                .map(|i| Sensitive::new(format!("share-{i}")))
                .collect(),
            threshold: scheme.threshold,
        })
    }

    async fn unseal(&self, _share: &Sensitive) -> Result<SealStatus, InstallError> {
        let mut state = lock(&self.state);
        state.unseal_calls += 1;
        state.progress += 1;
        if !self.never_unseals && state.progress >= state.threshold {
            state.sealed = false;
            state.progress = 0;
        }
        Ok(SealStatus {
            initialized: state.initialized,
            sealed: state.sealed,
        })
    }
}

/// Keeps "encrypted" documents in memory.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    documents: Mutex<BTreeMap<PathBuf, Mapping>>,
    drop_writes: bool,
}

impl MemorySecretStore {
    /// Store that reports success but never keeps anything.
    pub fn dropping_writes() -> Self {
        Self {
            drop_writes: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.documents).contains_key(path)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn encrypt_and_store(&self, path: &Path, values: &Mapping) -> Result<(), InstallError> {
        if !self.drop_writes {
            lock(&self.documents).insert(path.to_path_buf(), values.clone());
        }
        Ok(())
    }

    async fn decrypt_and_load(&self, path: &Path) -> Result<Option<Mapping>, InstallError> {
        Ok(lock(&self.documents).get(path).cloned())
    }
}

/// One scripted operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Select(usize),
    Text(String),
    Confirm(bool),
}

impl Answer {
    pub fn text(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Replays answers in order. Rejected text answers are recorded and the next
/// answer is tried, like an operator retyping.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<usize>,
    rejections: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of prompts shown.
    pub fn asked(&self) -> usize {
        *lock(&self.asked)
    }

    pub fn rejections(&self) -> Vec<String> {
        lock(&self.rejections).clone()
    }

    fn next(&self) -> Option<Answer> {
        lock(&self.answers).pop_front()
    }
}

impl Prompter for ScriptedPrompter {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        *lock(&self.asked) += 1;
        match self.next() {
            Some(Answer::Select(index)) if index < items.len() => Ok(index),
            None => Ok(default),
            Some(other) => bail!("unexpected answer {other:?} for {prompt:?}"),
        }
    }

    fn input(&self, prompt: &str, default: Option<&str>, validate: Validator<'_>) -> Result<String> {
        *lock(&self.asked) += 1;
        loop {
            let text = match self.next() {
                Some(Answer::Text(text)) if text.is_empty() => default.unwrap_or_default().to_string(),
                Some(Answer::Text(text)) => text,
                None => match default {
                    Some(default) => default.to_string(),
                    None => bail!("no scripted answer for {prompt:?}"),
                },
                Some(other) => bail!("unexpected answer {other:?} for {prompt:?}"),
            };
            match validate(&text) {
                Ok(()) => return Ok(text),
                Err(message) => lock(&self.rejections).push(message),
            }
        }
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        *lock(&self.asked) += 1;
        match self.next() {
            Some(Answer::Confirm(value)) => Ok(value),
            None => Ok(default),
            Some(other) => bail!("unexpected answer {other:?} for {prompt:?}"),
        }
    }
}

/// Cluster that is ready unless configured otherwise.
#[derive(Debug, Default)]
pub struct FakeProbe {
    certificate_misses: Mutex<u32>,
    certificate_checks: Mutex<Vec<String>>,
    restarts: Mutex<usize>,
    health_urls: Mutex<Vec<String>>,
}

impl FakeProbe {
    /// Certificates report not ready for the first `misses` checks.
    pub fn certificates_ready_after(misses: u32) -> Self {
        Self {
            certificate_misses: Mutex::new(misses),
            ..Self::default()
        }
    }

    /// Root modules whose certificates were checked, in order.
    pub fn certificate_checks(&self) -> Vec<String> {
        lock(&self.certificate_checks).clone()
    }

    pub fn restarts(&self) -> usize {
        *lock(&self.restarts)
    }

    pub fn health_urls(&self) -> Vec<String> {
        lock(&self.health_urls).clone()
    }
}

#[async_trait]
impl ClusterProbe for FakeProbe {
    async fn pods_running(&self, _namespace: &str) -> Result<bool, ProbeError> {
        Ok(true)
    }

    async fn certificates_ready(&self, _namespace: &str, root_module: &str) -> Result<bool, ProbeError> {
        lock(&self.certificate_checks).push(root_module.to_string());
        let mut misses = lock(&self.certificate_misses);
        if *misses == 0 {
            return Ok(true);
        }
        *misses -= 1;
        Ok(false)
    }

    async fn restart_deployments(&self, _namespace: &str) -> Result<(), ProbeError> {
        *lock(&self.restarts) += 1;
        Ok(())
    }

    async fn endpoint_healthy(&self, url: &str) -> Result<bool, ProbeError> {
        lock(&self.health_urls).push(url.to_string());
        Ok(true)
    }
}

/// Account with a configurable vCPU quota.
#[derive(Debug)]
pub struct FakeIdentity {
    quota: f64,
}

impl FakeIdentity {
    pub fn with_quota(quota: f64) -> Self {
        Self { quota }
    }
}

impl Default for FakeIdentity {
    fn default() -> Self {
        Self::with_quota(64.0)
    }
}

#[async_trait]
impl CloudIdentity for FakeIdentity {
    async fn get_identity(&self, _profile: &str) -> Result<CallerIdentity, InstallError> {
        Ok(CallerIdentity {
            account: "123456789012".to_string(),
            arn: "arn:aws:iam::123456789012:user/installer".to_string(),
            user_id: "AIDAEXAMPLE".to_string(),
        })
    }

    async fn vcpu_quota(&self, _profile: &str, _region: &str) -> Result<f64, InstallError> {
        Ok(self.quota)
    }
}

/// Every collaborator of an [`InstallContext`], kept for inspection.
pub struct Fakes {
    pub apply: Arc<FakeApplyEngine>,
    pub proxies: Arc<FakeProxyLauncher>,
    pub vault: Arc<FakeVault>,
    pub secrets: Arc<MemorySecretStore>,
    pub identity: Arc<FakeIdentity>,
    pub probe: Arc<FakeProbe>,
    pub prompter: Arc<ScriptedPrompter>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            apply: Arc::default(),
            proxies: Arc::default(),
            vault: Arc::new(FakeVault::uninitialized()),
            secrets: Arc::default(),
            identity: Arc::default(),
            probe: Arc::default(),
            prompter: Arc::new(ScriptedPrompter::new([
                Answer::text("prod-cluster"),
                Answer::text("Production cluster"),
                Answer::text("ops@example.com"),
            ])),
        }
    }
}

impl Fakes {
    /// Fresh recorders against the same Vault and secret store, as a later run sees them.
    pub fn rerun(&self) -> Self {
        Self {
            vault: Arc::clone(&self.vault),
            secrets: Arc::clone(&self.secrets),
            ..Self::default()
        }
    }

    /// Context for `target` with millisecond polls.
    pub fn context(&self, target: &InstallationTarget) -> InstallContext {
        let fast = PollSpec::new(3, Duration::from_millis(1));
        InstallContext {
            target: target.clone(),
            apply: self.apply.clone(),
            proxies: self.proxies.clone(),
            vault: self.vault.clone(),
            secrets: self.secrets.clone(),
            identity: self.identity.clone(),
            probe: self.probe.clone(),
            prompter: self.prompter.clone(),
            checkpoint: CheckpointStore::new(target.region_dir.join(CHECKPOINT_FILE)),
            polls: PollSettings {
                vault_pods: fast,
                vault_health: fast,
                certificate_ready: fast,
                proxy_ready: fast,
            },
            recovery: RecoveryScheme::default(),
            cancel: CancellationToken::new(),
        }
    }
}
