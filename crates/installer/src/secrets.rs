//! Encryption at rest for sensitive files.
//!
//! Secrets are stored as SOPS-encrypted YAML inside the repository. The
//! [`SecretStore`] trait keeps the encryption tool swappable in tests.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::InstallError;
use crate::files;

/// A secret string. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive(String);

impl Sensitive {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sensitive(***)")
    }
}

/// Encrypted key/value storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Encrypt `values` and write them to `path`, replacing its contents.
    async fn encrypt_and_store(&self, path: &Path, values: &Mapping) -> Result<(), InstallError>;

    /// Decrypt `path`, returning `None` when it does not exist.
    async fn decrypt_and_load(&self, path: &Path) -> Result<Option<Mapping>, InstallError>;
}

/// Serialize `value` and store it encrypted.
///
/// # Errors
///
/// Returns an error if `value` is not a mapping or encryption fails.
pub async fn store_typed<T: Serialize + Sync>(
    store: &dyn SecretStore,
    path: &Path,
    value: &T,
) -> Result<(), InstallError> {
    let mapping = match serde_yaml::to_value(value) {
        Ok(Value::Mapping(mapping)) => mapping,
        Ok(_) => {
            return Err(InstallError::Encryption {
                operation: "encrypt",
                path: path.to_path_buf(),
                reason: "secret documents must be mappings".to_string(),
            })
        }
        Err(e) => {
            return Err(InstallError::Encryption {
                operation: "encrypt",
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    store.encrypt_and_store(path, &mapping).await
}

/// Load and deserialize an encrypted document.
///
/// # Errors
///
/// Returns an error if decryption fails or the document does not match `T`.
pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn SecretStore,
    path: &Path,
) -> Result<Option<T>, InstallError> {
    let Some(mapping) = store.decrypt_and_load(path).await? else {
        return Ok(None);
    };
    serde_yaml::from_value(Value::Mapping(mapping))
        .map(Some)
        .map_err(|e| InstallError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// [`SecretStore`] backed by the `sops` CLI.
#[derive(Debug, Clone, Default)]
pub struct SopsStore;

impl SopsStore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretStore for SopsStore {
    async fn encrypt_and_store(&self, path: &Path, values: &Mapping) -> Result<(), InstallError> {
        let err = |reason: String| InstallError::Encryption {
            operation: "encrypt",
            path: path.to_path_buf(),
            reason,
        };
        let plaintext = serde_yaml::to_string(values).map_err(|e| err(e.to_string()))?;

        let mut child = Command::new("sops")
            .args(["--encrypt", "--input-type", "yaml", "--output-type", "yaml"])
            .arg("--filename-override")
            .arg(path)
            .arg("/dev/stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| err(format!("failed to run sops: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(plaintext.as_bytes())
                .await
                .map_err(|e| err(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| err(e.to_string()))?;
        if !output.status.success() {
            return Err(err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        files::write_atomic(path, &output.stdout)?;
        debug!(path = %path.display(), "Stored encrypted secrets");
        Ok(())
    }

    async fn decrypt_and_load(&self, path: &Path) -> Result<Option<Mapping>, InstallError> {
        if !path.exists() {
            return Ok(None);
        }
        let err = |reason: String| InstallError::Encryption {
            operation: "decrypt",
            path: path.to_path_buf(),
            reason,
        };

        let output = Command::new("sops")
            .args(["--decrypt", "--output-type", "yaml"])
            .arg(path)
            .output()
            .await
            .map_err(|e| err(format!("failed to run sops: {e}")))?;
        if !output.status.success() {
            return Err(err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        match serde_yaml::from_slice::<Value>(&output.stdout) {
            Ok(Value::Mapping(mapping)) => Ok(Some(mapping)),
            Ok(Value::Null) => Ok(Some(Mapping::new())),
            Ok(_) => Err(err("decrypted document is not a mapping".to_string())),
            Err(e) => Err(err(e.to_string())),
        }
    }
}
