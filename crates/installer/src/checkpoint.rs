//! Installation checkpoint persistence.
//!
//! The checkpoint records which installer steps finished and the answers the
//! operator gave, so a restarted run neither repeats work nor asks again.
//! Loading never fails: a missing, unparsable, or schema-invalid file is
//! reported and replaced by an empty record.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::files;
use crate::inputs::InputShape;

/// Schema version of the checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Installer steps whose completion is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Network,
    ClusterControlPlane,
    InternalNetworking,
    PolicyController,
    StorageDrivers,
    SecretsBackend,
    Certificates,
    ServiceMesh,
    InboundNetworking,
    Autoscaling,
    ClusterExtensions,
    /// Vault initialized and its recovery material stored.
    VaultInitialized,
    /// Vault's public address written to `region.yaml`.
    VaultAddressPersisted,
    /// SSH connection info for the bastion written.
    BastionConnectivity,
}

/// Operator answers kept across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKey {
    ClusterName,
    ClusterDescription,
    AlertEmail,
    VaultAddress,
}

impl InputKey {
    /// Shape every saved value must have.
    #[must_use]
    pub const fn shape(self) -> InputShape {
        match self {
            Self::ClusterName => InputShape::KubeName,
            Self::ClusterDescription => InputShape::Description,
            Self::AlertEmail => InputShape::Email,
            Self::VaultAddress => InputShape::Url,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::ClusterName => "cluster_name",
            Self::ClusterDescription => "cluster_description",
            Self::AlertEmail => "alert_email",
            Self::VaultAddress => "vault_address",
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of installer progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub steps: BTreeMap<StepId, bool>,
    pub saved_inputs: BTreeMap<InputKey, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Default for CheckpointRecord {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            steps: BTreeMap::new(),
            saved_inputs: BTreeMap::new(),
            updated_at: None,
        }
    }
}

impl CheckpointRecord {
    /// Parse and validate raw file contents, collecting every issue found.
    fn parse(raw: &str) -> Result<Self, Vec<String>> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| vec![format!("not valid JSON: {e}")])?;
        let Value::Object(root) = value else {
            return Err(vec!["expected an object at the top level".to_string()]);
        };

        let mut issues = Vec::new();
        let mut record = Self::default();

        match root.get("version").and_then(Value::as_u64) {
            Some(v) if v == u64::from(CHECKPOINT_VERSION) => {}
            Some(v) => issues.push(format!("version: unsupported version {v}")),
            None => issues.push("version: missing or not a number".to_string()),
        }

        match root.get("steps") {
            None | Some(Value::Null) => {}
            Some(Value::Object(steps)) => {
                for (name, done) in steps {
                    let Ok(step) = serde_json::from_value::<StepId>(Value::String(name.clone()))
                    else {
                        debug!(step = %name, "Ignoring unknown checkpoint step");
                        continue;
                    };
                    match done.as_bool() {
                        Some(done) => {
                            record.steps.insert(step, done);
                        }
                        None => issues.push(format!("steps.{name}: expected a boolean")),
                    }
                }
            }
            Some(_) => issues.push("steps: expected an object".to_string()),
        }

        match root.get("saved_inputs") {
            None | Some(Value::Null) => {}
            Some(Value::Object(inputs)) => {
                for (name, value) in inputs {
                    let Ok(key) = serde_json::from_value::<InputKey>(Value::String(name.clone()))
                    else {
                        issues.push(format!("saved_inputs.{name}: unknown input"));
                        continue;
                    };
                    match value.as_str() {
                        Some(text) => match key.shape().check_str(text) {
                            Ok(()) => {
                                record.saved_inputs.insert(key, text.to_string());
                            }
                            Err(reason) => issues.push(format!("saved_inputs.{name}: {reason}")),
                        },
                        None => issues.push(format!("saved_inputs.{name}: expected a string")),
                    }
                }
            }
            Some(_) => issues.push("saved_inputs: expected an object".to_string()),
        }

        record.updated_at = root
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);

        if issues.is_empty() {
            Ok(record)
        } else {
            Err(issues)
        }
    }
}

/// Process-wide checkpoint store. Loads lazily, persists every mutation.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    record: Mutex<Option<CheckpointRecord>>,
}

impl CheckpointStore {
    /// Create a store backed by `path`. Nothing is read until first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint from disk, replacing any cached copy.
    pub fn load(&self) -> CheckpointRecord {
        let record = read_from_disk(&self.path);
        *self.lock() = Some(record.clone());
        record
    }

    /// Current record (loading it on first use).
    pub fn snapshot(&self) -> CheckpointRecord {
        self.with_record(Clone::clone)
    }

    pub fn is_step_complete(&self, step: StepId) -> bool {
        self.with_record(|record| record.steps.get(&step).copied().unwrap_or(false))
    }

    /// Mark `step` complete and persist immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint file cannot be written.
    pub fn set_step_complete(&self, step: StepId) -> Result<(), InstallError> {
        self.mutate(|record| {
            if record.steps.get(&step) == Some(&true) {
                return false;
            }
            record.steps.insert(step, true);
            true
        })?;
        debug!(step = ?step, "Checkpoint step complete");
        Ok(())
    }

    pub fn get_saved_input(&self, key: InputKey) -> Option<String> {
        self.with_record(|record| record.saved_inputs.get(&key).cloned())
    }

    /// Validate and save an operator answer.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::InvalidSavedInput`] if the value does not
    /// match the key's shape (nothing is written), or an I/O error.
    pub fn update_saved_input(&self, key: InputKey, value: impl Into<String>) -> Result<(), InstallError> {
        let value = value.into();
        key.shape()
            .check_str(&value)
            .map_err(|reason| InstallError::InvalidSavedInput { key, reason })?;
        self.mutate(|record| {
            if record.saved_inputs.get(&key) == Some(&value) {
                return false;
            }
            record.saved_inputs.insert(key, value);
            true
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<CheckpointRecord>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_record<R>(&self, f: impl FnOnce(&CheckpointRecord) -> R) -> R {
        let mut guard = self.lock();
        let record = guard.get_or_insert_with(|| read_from_disk(&self.path));
        f(record)
    }

    /// Apply `change` to a copy of the record; when it reports a change,
    /// persist the copy and only then publish it.
    fn mutate(&self, change: impl FnOnce(&mut CheckpointRecord) -> bool) -> Result<(), InstallError> {
        let mut guard = self.lock();
        let current = guard.get_or_insert_with(|| read_from_disk(&self.path));
        let mut next = current.clone();
        if !change(&mut next) {
            return Ok(());
        }
        next.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let contents = serde_json::to_string_pretty(&next).map_err(|e| InstallError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        files::write_atomic(&self.path, contents.as_bytes())?;
        *guard = Some(next);
        Ok(())
    }
}

fn read_from_disk(path: &Path) -> CheckpointRecord {
    let raw = match files::read_optional(path) {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            debug!(path = %path.display(), "No checkpoint found, starting fresh");
            return CheckpointRecord::default();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Unable to read checkpoint, starting fresh");
            return CheckpointRecord::default();
        }
    };

    match CheckpointRecord::parse(&raw) {
        Ok(record) => {
            info!(
                path = %path.display(),
                completed = record.steps.values().filter(|done| **done).count(),
                "Loaded installation checkpoint"
            );
            record
        }
        Err(issues) => {
            for issue in &issues {
                warn!(path = %path.display(), "Invalid checkpoint: {issue}");
            }
            warn!(path = %path.display(), "Discarding checkpoint and starting fresh");
            CheckpointRecord::default()
        }
    }
}
