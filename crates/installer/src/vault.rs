//! Vault initialization and unseal ritual.
//!
//! A freshly deployed Vault must be initialized exactly once. Initialization
//! returns the root token and the recovery shares in a single response; they
//! are encrypted into the module directory and read back before the ritual
//! continues, because losing them means losing the cluster's secrets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::InstallError;
use crate::inputs::{self, InputOverride, InputShape};
use crate::modules::ModuleId;
use crate::secrets::{self, SecretStore, Sensitive};

/// Encrypted file holding the root token.
pub const VAULT_SECRETS_FILE: &str = "secrets.yaml";
/// Encrypted file holding the recovery shares.
pub const VAULT_RECOVERY_FILE: &str = "recovery.yaml";
/// Bootstrap-only input that keeps the Vault module from waiting on readiness.
pub const VAULT_WAIT_INPUT: &str = "wait";

/// Number of recovery shares and how many are needed to unseal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryScheme {
    pub shares: u8,
    pub threshold: u8,
}

impl Default for RecoveryScheme {
    fn default() -> Self {
        Self {
            shares: 1,
            threshold: 1,
        }
    }
}

impl RecoveryScheme {
    /// # Errors
    ///
    /// Returns [`InstallError::InvalidRecoveryScheme`] unless `1 <= threshold <= shares`.
    pub fn validate(self) -> Result<Self, InstallError> {
        if self.threshold == 0 || self.threshold > self.shares {
            return Err(InstallError::InvalidRecoveryScheme {
                shares: self.shares,
                threshold: self.threshold,
            });
        }
        Ok(self)
    }
}

/// Seal state as reported by Vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
}

/// Root credential and recovery shares produced by initialization.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryMaterial {
    pub root_token: Sensitive,
    pub shares: Vec<Sensitive>,
    pub threshold: u8,
}

impl std::fmt::Debug for RecoveryMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryMaterial")
            .field("shares", &self.shares.len())
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Operations the ritual needs from Vault.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    async fn status(&self) -> Result<SealStatus, InstallError>;

    /// Initialize with the given scheme. Must only be called once per backend.
    async fn initialize(&self, scheme: RecoveryScheme) -> Result<RecoveryMaterial, InstallError>;

    /// Submit one recovery share and return the resulting seal state.
    async fn unseal(&self, share: &Sensitive) -> Result<SealStatus, InstallError>;
}

#[derive(Deserialize)]
struct InitResponse {
    root_token: Sensitive,
    #[serde(default)]
    recovery_keys_hex: Vec<Sensitive>,
    #[serde(default)]
    unseal_keys_hex: Vec<Sensitive>,
}

/// [`SecretsBackend`] that runs the `vault` CLI inside the first Vault pod.
#[derive(Debug, Clone)]
pub struct KubectlVault {
    kube_context: String,
    namespace: String,
    pod: String,
}

impl KubectlVault {
    pub fn new(kube_context: impl Into<String>) -> Self {
        Self {
            kube_context: kube_context.into(),
            namespace: "vault".to_string(),
            pod: "vault-0".to_string(),
        }
    }

    async fn exec(&self, operation: &'static str, args: &[&str]) -> Result<std::process::Output, InstallError> {
        Command::new("kubectl")
            .args(["exec", "--context", self.kube_context.as_str()])
            .args(["-n", self.namespace.as_str(), self.pod.as_str(), "--", "vault"])
            .args(args)
            .output()
            .await
            .map_err(|e| InstallError::Vault {
                operation,
                reason: format!("failed to run kubectl: {e}"),
            })
    }

    fn parse_status(operation: &'static str, output: &std::process::Output) -> Result<SealStatus, InstallError> {
        // `vault status` exits with 2 when sealed but still prints JSON.
        serde_json::from_slice(&output.stdout).map_err(|e| InstallError::Vault {
            operation,
            reason: format!(
                "unexpected output ({e}): {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[async_trait]
impl SecretsBackend for KubectlVault {
    async fn status(&self) -> Result<SealStatus, InstallError> {
        let output = self.exec("status", &["status", "-format=json"]).await?;
        Self::parse_status("status", &output)
    }

    async fn initialize(&self, scheme: RecoveryScheme) -> Result<RecoveryMaterial, InstallError> {
        let shares = format!("-recovery-shares={}", scheme.shares);
        let threshold = format!("-recovery-threshold={}", scheme.threshold);
        let output = self
            .exec("init", &["operator", "init", shares.as_str(), threshold.as_str(), "-format=json"])
            .await?;
        if !output.status.success() {
            return Err(InstallError::Vault {
                operation: "init",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let response: InitResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| InstallError::Vault {
                operation: "init",
                reason: format!("unexpected output: {e}"),
            })?;
        let shares = if response.recovery_keys_hex.is_empty() {
            response.unseal_keys_hex
        } else {
            response.recovery_keys_hex
        };
        Ok(RecoveryMaterial {
            root_token: response.root_token,
            shares,
            threshold: scheme.threshold,
        })
    }

    async fn unseal(&self, share: &Sensitive) -> Result<SealStatus, InstallError> {
        let output = self
            .exec("unseal", &["operator", "unseal", "-format=json", share.expose()])
            .await?;
        if !output.status.success() && output.stdout.is_empty() {
            return Err(InstallError::Vault {
                operation: "unseal",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Self::parse_status("unseal", &output)
    }
}

/// Phases of the ritual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RitualState {
    NotInitialized,
    Initializing,
    Sealed,
    Unsealing,
    Ready,
}

/// What the ritual did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RitualOutcome {
    pub root_token: Sensitive,
    /// Whether this run initialized Vault.
    pub initialized: bool,
    /// Recovery shares submitted.
    pub shares_applied: usize,
    /// States visited, in order.
    pub transitions: Vec<RitualState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RootTokenDocument {
    root_token: Sensitive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RecoveryDocument {
    recovery_keys: Vec<Sensitive>,
    recovery_shares: u8,
    recovery_threshold: u8,
}

/// Drives Vault from "just deployed" to "unsealed".
pub struct VaultRitual<'a> {
    backend: &'a dyn SecretsBackend,
    store: &'a dyn SecretStore,
    module_dir: PathBuf,
    scheme: RecoveryScheme,
    transitions: Vec<RitualState>,
}

impl<'a> VaultRitual<'a> {
    pub fn new(
        backend: &'a dyn SecretsBackend,
        store: &'a dyn SecretStore,
        module_dir: impl Into<PathBuf>,
        scheme: RecoveryScheme,
    ) -> Self {
        Self {
            backend,
            store,
            module_dir: module_dir.into(),
            scheme,
            transitions: Vec::new(),
        }
    }

    fn secrets_path(&self) -> PathBuf {
        self.module_dir.join(VAULT_SECRETS_FILE)
    }

    fn recovery_path(&self) -> PathBuf {
        self.module_dir.join(VAULT_RECOVERY_FILE)
    }

    fn enter(&mut self, state: RitualState) {
        debug!(state = ?state, "Vault ritual transition");
        self.transitions.push(state);
    }

    /// Run the ritual to completion.
    ///
    /// # Errors
    ///
    /// Fails if the scheme is invalid, the material cannot be stored and
    /// confirmed, the material is missing for an initialized Vault, or Vault
    /// is still sealed after every share was applied.
    pub async fn run(mut self) -> Result<RitualOutcome, InstallError> {
        self.scheme.validate()?;
        let status = self.backend.status().await?;
        let stored_root = secrets::load_typed::<RootTokenDocument>(self.store, &self.secrets_path()).await?;

        if status.initialized && !status.sealed {
            info!("Vault is already unsealed");
            let root = stored_root.ok_or_else(|| InstallError::MissingRecoveryMaterial {
                path: self.secrets_path(),
            })?;
            return self.finish(root.root_token, false, 0);
        }

        let (material, initialized) = if status.initialized {
            self.enter(RitualState::Sealed);
            (self.load_material(stored_root).await?, false)
        } else {
            self.enter(RitualState::NotInitialized);
            if stored_root.is_some() {
                return Err(InstallError::StaleRecoveryMaterial {
                    path: self.secrets_path(),
                });
            }
            self.enter(RitualState::Initializing);
            let material = self.backend.initialize(self.scheme).await?;
            self.persist(&material).await?;
            info!(shares = material.shares.len(), "Vault initialized and recovery material stored");
            self.enter(RitualState::Sealed);
            (material, true)
        };

        self.enter(RitualState::Unsealing);
        let mut applied = 0;
        for share in &material.shares {
            let status = self.backend.unseal(share).await?;
            applied += 1;
            debug!(applied, "Submitted recovery share");
            if !status.sealed {
                return self.finish(material.root_token.clone(), initialized, applied);
            }
        }
        Err(InstallError::UnsealExhausted { applied })
    }

    fn finish(
        mut self,
        root_token: Sensitive,
        initialized: bool,
        shares_applied: usize,
    ) -> Result<RitualOutcome, InstallError> {
        inputs::apply_overrides(
            ModuleId::KubeVault,
            &self.module_dir,
            &[InputOverride::set(VAULT_WAIT_INPUT, InputShape::Bool, true)],
        )?;
        self.enter(RitualState::Ready);
        Ok(RitualOutcome {
            root_token,
            initialized,
            shares_applied,
            transitions: self.transitions,
        })
    }

    async fn load_material(
        &self,
        stored_root: Option<RootTokenDocument>,
    ) -> Result<RecoveryMaterial, InstallError> {
        let root = stored_root.ok_or_else(|| InstallError::MissingRecoveryMaterial {
            path: self.secrets_path(),
        })?;
        let recovery = secrets::load_typed::<RecoveryDocument>(self.store, &self.recovery_path())
            .await?
            .ok_or_else(|| InstallError::MissingRecoveryMaterial {
                path: self.recovery_path(),
            })?;
        Ok(RecoveryMaterial {
            root_token: root.root_token,
            shares: recovery.recovery_keys,
            threshold: recovery.recovery_threshold,
        })
    }

    async fn persist(&self, material: &RecoveryMaterial) -> Result<(), InstallError> {
        let root = RootTokenDocument {
            root_token: material.root_token.clone(),
        };
        let recovery = RecoveryDocument {
            recovery_keys: material.shares.clone(),
            recovery_shares: self.scheme.shares,
            recovery_threshold: material.threshold,
        };
        secrets::store_typed(self.store, &self.recovery_path(), &recovery).await?;
        secrets::store_typed(self.store, &self.secrets_path(), &root).await?;

        confirm(self.store, &self.recovery_path(), &recovery).await?;
        confirm(self.store, &self.secrets_path(), &root).await
    }
}

async fn confirm<T>(store: &dyn SecretStore, path: &Path, expected: &T) -> Result<(), InstallError>
where
    T: PartialEq + serde::de::DeserializeOwned,
{
    match secrets::load_typed::<T>(store, path).await {
        Ok(Some(stored)) if stored == *expected => Ok(()),
        _ => Err(InstallError::RecoveryNotPersisted {
            path: path.to_path_buf(),
        }),
    }
}

/// Load the root token stored by the ritual.
///
/// # Errors
///
/// Returns [`InstallError::MissingRecoveryMaterial`] when it was never stored.
pub async fn load_root_token(store: &dyn SecretStore, module_dir: &Path) -> Result<Sensitive, InstallError> {
    let path = module_dir.join(VAULT_SECRETS_FILE);
    secrets::load_typed::<RootTokenDocument>(store, &path)
        .await?
        .map(|doc| doc.root_token)
        .ok_or(InstallError::MissingRecoveryMaterial { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::read_flag;
    use crate::testing::{FakeVault, MemorySecretStore};
    use tempfile::TempDir;

    fn scheme(shares: u8, threshold: u8) -> RecoveryScheme {
        RecoveryScheme { shares, threshold }
    }

    #[tokio::test]
    async fn test_fresh_vault_is_initialized_persisted_and_unsealed() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::default();

        let outcome = VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap();

        assert!(outcome.initialized);
        assert_eq!(outcome.shares_applied, 1);
        assert_eq!(vault.init_calls(), 1);
        assert_eq!(
            outcome.transitions,
            vec![
                RitualState::NotInitialized,
                RitualState::Initializing,
                RitualState::Sealed,
                RitualState::Unsealing,
                RitualState::Ready,
            ]
        );
        assert!(store.contains(&dir.path().join(VAULT_RECOVERY_FILE)));
        assert_eq!(
            load_root_token(&store, dir.path()).await.unwrap(),
            outcome.root_token
        );
        assert_eq!(read_flag(dir.path(), VAULT_WAIT_INPUT).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_threshold_scheme_stops_once_unsealed() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::default();

        let outcome = VaultRitual::new(&vault, &store, dir.path(), scheme(5, 3))
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.shares_applied, 3);
        assert_eq!(vault.unseal_calls(), 3);
    }

    #[tokio::test]
    async fn test_already_unsealed_skips_to_ready() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::default();
        VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap();

        let outcome = VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap();

        assert!(!outcome.initialized);
        assert_eq!(outcome.shares_applied, 0);
        assert_eq!(outcome.transitions, vec![RitualState::Ready]);
        assert_eq!(vault.init_calls(), 1);
        assert_eq!(vault.unseal_calls(), 1);
    }

    #[tokio::test]
    async fn test_sealed_vault_reuses_stored_material() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::default();
        VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap();
        vault.reseal();

        let outcome = VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap();

        assert!(!outcome.initialized);
        assert_eq!(vault.init_calls(), 1);
        assert_eq!(outcome.shares_applied, 1);
    }

    #[tokio::test]
    async fn test_unseal_exhaustion_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized().never_unseals();
        let store = MemorySecretStore::default();

        let err = VaultRitual::new(&vault, &store, dir.path(), scheme(3, 2))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::UnsealExhausted { applied: 3 }));
        assert_eq!(read_flag(dir.path(), VAULT_WAIT_INPUT).unwrap(), None);
    }

    #[tokio::test]
    async fn test_initialized_vault_without_material() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::initialized_sealed();
        let store = MemorySecretStore::default();

        let err = VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::MissingRecoveryMaterial { .. }));
        assert_eq!(vault.init_calls(), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_material_stops_before_unseal() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::dropping_writes();

        let err = VaultRitual::new(&vault, &store, dir.path(), RecoveryScheme::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::RecoveryNotPersisted { .. }));
        assert_eq!(vault.unseal_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_scheme_is_rejected() {
        let dir = TempDir::new().unwrap();
        let vault = FakeVault::uninitialized();
        let store = MemorySecretStore::default();

        let err = VaultRitual::new(&vault, &store, dir.path(), scheme(2, 3))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::InvalidRecoveryScheme { .. }));
        assert_eq!(vault.init_calls(), 0);
    }
}
