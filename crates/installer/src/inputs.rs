//! Module input overrides.
//!
//! The installer never edits a module's `terragrunt.hcl`. Values it needs to
//! set go into the `extra_inputs` mapping of the module's `module.yaml`,
//! which the HCL merges in. Every override declares the shape its value must
//! have and is validated before anything is written.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::InstallError;
use crate::files;
use crate::modules::ModuleId;

/// Per-module input file.
pub const MODULE_CONFIG_FILE: &str = "module.yaml";
/// Per-module Terragrunt configuration.
pub const MODULE_HCL_FILE: &str = "terragrunt.hcl";
/// Key of the override mapping inside `module.yaml`.
pub const EXTRA_INPUTS_KEY: &str = "extra_inputs";

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());
static DOMAIN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").ok()
});
static DNS_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").ok());
static DESCRIPTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_ .:/=+@-]+$").ok());

fn matches(pattern: &LazyLock<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(text))
}

/// Declared shape of an input value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputShape {
    Bool,
    Text,
    Email,
    /// Fully qualified lowercase domain name.
    Domain,
    /// Single lowercase DNS label.
    Subdomain,
    /// Kubernetes-style resource name, 3 to 63 characters.
    KubeName,
    /// Free text of 3 to 255 characters from a restricted character set.
    Description,
    /// `http(s)://` URL.
    Url,
    Integer { min: i64, max: i64 },
    /// Mapping with string keys.
    StringMap,
    Any,
}

impl InputShape {
    /// Check `value` against the shape.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value does not conform.
    pub fn check(self, value: &Value) -> Result<(), String> {
        match self {
            Self::Bool => value
                .as_bool()
                .map(|_| ())
                .ok_or_else(|| "expected true or false".to_string()),
            Self::Integer { min, max } => match value.as_i64() {
                Some(n) if (min..=max).contains(&n) => Ok(()),
                Some(n) => Err(format!("{n} is outside {min}..={max}")),
                None => Err("expected an integer".to_string()),
            },
            Self::StringMap => match value {
                Value::Mapping(mapping) if mapping.keys().all(Value::is_string) => Ok(()),
                Value::Mapping(_) => Err("all keys must be strings".to_string()),
                _ => Err("expected a mapping".to_string()),
            },
            Self::Any => Ok(()),
            _ => value
                .as_str()
                .ok_or_else(|| "expected a string".to_string())
                .and_then(|text| self.check_str(text)),
        }
    }

    /// Check a textual value against the shape.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value does not conform.
    pub fn check_str(self, text: &str) -> Result<(), String> {
        match self {
            Self::Text | Self::Any => Ok(()),
            Self::Email if matches(&EMAIL, text) => Ok(()),
            Self::Email => Err(format!("'{text}' is not a valid email address")),
            Self::Domain if matches(&DOMAIN, text) => Ok(()),
            Self::Domain => Err(format!("'{text}' is not a valid lowercase domain")),
            Self::Subdomain if matches(&DNS_LABEL, text) => Ok(()),
            Self::Subdomain => Err(format!(
                "'{text}' must be a lowercase DNS label (letters, digits and '-')"
            )),
            Self::KubeName => {
                if !(3..=63).contains(&text.len()) {
                    Err("must be between 3 and 63 characters".to_string())
                } else if !matches(&DNS_LABEL, text) {
                    Err("must contain only lowercase letters, digits and '-', starting and ending with a letter or digit".to_string())
                } else {
                    Ok(())
                }
            }
            Self::Description => {
                if !(3..=255).contains(&text.len()) {
                    Err("must be between 3 and 255 characters".to_string())
                } else if !matches(&DESCRIPTION, text) {
                    Err("may only contain letters, digits, spaces and _ . : / = + - @".to_string())
                } else if text.to_ascii_lowercase().starts_with("aws:") {
                    Err("must not start with 'aws:'".to_string())
                } else {
                    Ok(())
                }
            }
            Self::Url if text.starts_with("https://") || text.starts_with("http://") => Ok(()),
            Self::Url => Err(format!("'{text}' must start with http:// or https://")),
            Self::Bool | Self::Integer { .. } | Self::StringMap => {
                self.check(&Value::String(text.to_string()))
            }
        }
    }
}

type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// A single `extra_inputs` value the installer sets on a module.
#[derive(Clone)]
pub struct InputOverride {
    name: String,
    shape: InputShape,
    update: UpdateFn,
}

impl InputOverride {
    /// Set `name` to a fixed value.
    pub fn set(name: impl Into<String>, shape: InputShape, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            shape,
            update: Arc::new(move |_| value.clone()),
        }
    }

    /// Compute the value of `name` from its current value.
    pub fn update(
        name: impl Into<String>,
        shape: InputShape,
        update: impl Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            shape,
            update: Arc::new(update),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for InputOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputOverride")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Overrides that passed validation and are ready to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedInputs(Vec<(String, Value)>);

impl ValidatedInputs {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Check that none of `overrides` is assigned directly in `hcl`.
///
/// # Errors
///
/// Returns [`InstallError::InputConflict`] for the first conflicting input.
pub fn check_conflicts(
    module: ModuleId,
    hcl_path: &Path,
    hcl: &str,
    overrides: &[InputOverride],
) -> Result<(), InstallError> {
    for input in overrides {
        let pattern = format!(r"(?m)^\s*{}\s*=", regex::escape(&input.name));
        let assigned = Regex::new(&pattern).is_ok_and(|re| re.is_match(hcl));
        if assigned {
            return Err(InstallError::InputConflict {
                module,
                input: input.name.clone(),
                path: hcl_path.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Compute and validate every override of `module` without writing anything.
///
/// # Errors
///
/// Returns [`InstallError::InvalidInput`] for the first value that does not
/// match its shape, or an error if `module.yaml` cannot be read.
pub fn validate_overrides(
    module: ModuleId,
    module_dir: &Path,
    overrides: &[InputOverride],
) -> Result<ValidatedInputs, InstallError> {
    let current = read_extra_inputs(module_dir)?;
    let mut validated = Vec::with_capacity(overrides.len());
    for input in overrides {
        let value = (input.update)(current.get(input.name.as_str()));
        input
            .shape
            .check(&value)
            .map_err(|reason| InstallError::InvalidInput {
                module,
                input: input.name.clone(),
                reason,
            })?;
        validated.push((input.name.clone(), value));
    }
    Ok(ValidatedInputs(validated))
}

/// Merge validated values into `extra_inputs` of the module's `module.yaml`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written.
pub fn write_overrides(module_dir: &Path, inputs: &ValidatedInputs) -> Result<(), InstallError> {
    if inputs.is_empty() {
        return Ok(());
    }
    let path = module_dir.join(MODULE_CONFIG_FILE);
    let mut config = files::read_yaml_mapping(&path)?;
    let mut extra = match config.remove(EXTRA_INPUTS_KEY) {
        Some(Value::Mapping(mapping)) => mapping,
        _ => Mapping::new(),
    };
    for (name, value) in &inputs.0 {
        extra.insert(Value::String(name.clone()), value.clone());
    }
    config.insert(Value::String(EXTRA_INPUTS_KEY.to_string()), Value::Mapping(extra));
    files::write_yaml(&path, &config)
}

/// Validate and then write `overrides` in one step.
///
/// # Errors
///
/// See [`validate_overrides`] and [`write_overrides`].
pub fn apply_overrides(
    module: ModuleId,
    module_dir: &Path,
    overrides: &[InputOverride],
) -> Result<(), InstallError> {
    let validated = validate_overrides(module, module_dir, overrides)?;
    write_overrides(module_dir, &validated)
}

/// Current `extra_inputs` of a module (empty when unset).
///
/// # Errors
///
/// Returns an error if `module.yaml` exists but cannot be parsed.
pub fn read_extra_inputs(module_dir: &Path) -> Result<Mapping, InstallError> {
    let config = files::read_yaml_mapping(&module_dir.join(MODULE_CONFIG_FILE))?;
    Ok(match config.get(EXTRA_INPUTS_KEY) {
        Some(Value::Mapping(mapping)) => mapping.clone(),
        _ => Mapping::new(),
    })
}

/// Read a boolean `extra_inputs` value.
///
/// # Errors
///
/// Returns an error if `module.yaml` exists but cannot be parsed.
pub fn read_flag(module_dir: &Path, name: &str) -> Result<Option<bool>, InstallError> {
    Ok(read_extra_inputs(module_dir)?.get(name).and_then(Value::as_bool))
}
