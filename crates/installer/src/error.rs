//! Typed errors raised by the installer components.
//!
//! Components return [`InstallError`] so callers can match on the failure
//! class; the orchestrator and CLI wrap these with `anyhow` context naming the
//! stage that was running.

use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::InputKey;
use crate::modules::ModuleId;
use crate::poll::{PollError, PollTimeoutError};

/// Errors produced by the installation engine.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The environment is not ready for an installation to start.
    #[error("{message}\n  → {remediation}")]
    Precondition {
        /// What is wrong.
        message: String,
        /// What the operator should do about it.
        remediation: String,
    },

    /// A module input override does not match its declared shape.
    #[error("invalid value for input '{input}' of module {module}: {reason}")]
    InvalidInput {
        /// Module the override targets.
        module: ModuleId,
        /// Input name.
        input: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A module input is configured both in `module.yaml` and the HCL file.
    #[error(
        "input '{input}' of module {module} is hard-coded in {}; remove it there so it can be managed through module.yaml",
        .path.display()
    )]
    InputConflict {
        /// Module the override targets.
        module: ModuleId,
        /// Input name.
        input: String,
        /// HCL file containing the assignment.
        path: PathBuf,
    },

    /// A saved operator answer does not match its declared shape.
    #[error("invalid value for {key}: {reason}")]
    InvalidSavedInput {
        /// Saved input key.
        key: InputKey,
        /// Why the value was rejected.
        reason: String,
    },

    /// The module directory has no configuration and no template was given.
    #[error("module {module} has no configuration at {} and no template was provided", .path.display())]
    MissingModule {
        /// Module that is missing.
        module: ModuleId,
        /// Expected configuration path.
        path: PathBuf,
    },

    /// The apply engine reported a failed apply.
    #[error("failed to deploy module {module}:\n{output}")]
    Apply {
        /// Module that failed.
        module: ModuleId,
        /// Tail of the engine's log output.
        output: String,
    },

    /// The apply engine could not be invoked at all.
    #[error("failed to run the apply engine for module {module}: {reason}")]
    ApplyEngine {
        /// Module being applied.
        module: ModuleId,
        /// Underlying cause.
        reason: String,
    },

    /// A module status record exists but cannot be parsed.
    #[error("corrupt module status record at {}: {reason}", .path.display())]
    CorruptStatus {
        /// Status file path.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },

    /// Reading a local file failed.
    #[error("failed to read {}", .path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// Writing a local file failed.
    #[error("failed to write {}", .path.display())]
    Write {
        /// File path.
        path: PathBuf,
        /// I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// A local file exists but does not parse.
    #[error("failed to parse {}: {reason}", .path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },

    /// A module template could not be rendered.
    #[error("failed to render template for module {module}: {reason}")]
    Template {
        /// Module being scaffolded.
        module: ModuleId,
        /// Render failure.
        reason: String,
    },

    /// The local Vault proxy could not be started.
    #[error("failed to start the Vault proxy for {purpose}: {reason}")]
    ProxyStart {
        /// What the proxy was needed for.
        purpose: String,
        /// Underlying cause.
        reason: String,
    },

    /// A Vault operation failed.
    #[error("vault {operation} failed: {reason}")]
    Vault {
        /// Operation name (`status`, `init`, `unseal`).
        operation: &'static str,
        /// Underlying cause.
        reason: String,
    },

    /// Vault is initialized but the recovery material is gone.
    #[error(
        "vault is already initialized but no recovery material was found at {}",
        .path.display()
    )]
    MissingRecoveryMaterial {
        /// Expected location of the material.
        path: PathBuf,
    },

    /// Recovery material exists but Vault reports it was never initialized.
    #[error(
        "recovery material exists at {} but vault reports it is not initialized; refusing to initialize again",
        .path.display()
    )]
    StaleRecoveryMaterial {
        /// Location of the existing material.
        path: PathBuf,
    },

    /// Every recovery share was applied and Vault is still sealed.
    #[error("vault is still sealed after applying all {applied} recovery shares")]
    UnsealExhausted {
        /// Number of shares submitted.
        applied: usize,
    },

    /// The requested recovery share scheme is not valid.
    #[error("invalid recovery scheme: threshold {threshold} must be between 1 and {shares} shares")]
    InvalidRecoveryScheme {
        /// Requested share count.
        shares: u8,
        /// Requested threshold.
        threshold: u8,
    },

    /// Encrypted recovery material could not be read back after writing.
    #[error("recovery material written to {} could not be confirmed", .path.display())]
    RecoveryNotPersisted {
        /// Location written.
        path: PathBuf,
    },

    /// Encrypting or decrypting a secrets file failed.
    #[error("failed to {operation} {}: {reason}", .path.display())]
    Encryption {
        /// `encrypt` or `decrypt`.
        operation: &'static str,
        /// File path.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// Concurrent branches were declared with a dependency between them.
    #[error("modules {first} and {second} cannot be deployed concurrently: {second} depends on {first}")]
    DependentBranches {
        /// Dependency.
        first: ModuleId,
        /// Dependent module.
        second: ModuleId,
    },

    /// A bounded poll ran out of attempts.
    #[error(transparent)]
    PollTimeout(#[from] PollTimeoutError),

    /// The operator interrupted the installation.
    #[error("installation interrupted")]
    Interrupted,
}

impl InstallError {
    /// Build a precondition failure with remediation text.
    pub fn precondition(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            remediation: remediation.into(),
        }
    }
}

impl From<PollError> for InstallError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout(timeout) => Self::PollTimeout(timeout),
            PollError::Interrupted => Self::Interrupted,
        }
    }
}
