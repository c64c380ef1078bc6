//! Local configuration file I/O.
//!
//! Reads tolerate missing files (`Ok(None)`); writes go through a temporary
//! file in the same directory and are renamed into place after an fsync so a
//! crash never leaves a half-written file behind.

use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::InstallError;

/// Read a file to a string, returning `None` when it does not exist.
///
/// # Errors
///
/// Returns [`InstallError::Read`] for any I/O failure other than not-found.
pub fn read_optional(path: &Path) -> Result<Option<String>, InstallError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(InstallError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read and deserialize a YAML file. Missing or empty files yield `None`.
///
/// # Errors
///
/// Returns [`InstallError::Parse`] when the file does not match `T`.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, InstallError> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| InstallError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Read a YAML file as a top-level mapping (empty when missing).
///
/// # Errors
///
/// Returns [`InstallError::Parse`] when the document is not a mapping.
pub fn read_yaml_mapping(path: &Path) -> Result<Mapping, InstallError> {
    match read_yaml::<Value>(path)? {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(mapping)) => Ok(mapping),
        Some(_) => Err(InstallError::Parse {
            path: path.to_path_buf(),
            reason: "expected a mapping at the top level".to_string(),
        }),
    }
}

/// Serialize `value` as YAML and write it atomically.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), InstallError> {
    let contents = serde_yaml::to_string(value).map_err(|e| InstallError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(path, contents.as_bytes())
}

/// Merge `values` into the top-level mapping stored at `path`.
///
/// # Errors
///
/// Returns an error if the existing file is not a mapping or the write fails.
pub fn upsert_yaml(path: &Path, values: Mapping) -> Result<(), InstallError> {
    let mut existing = read_yaml_mapping(path)?;
    for (key, value) in values {
        existing.insert(key, value);
    }
    write_yaml(path, &existing)
}

/// Write `contents` to `path` via a synced temporary file and rename.
///
/// # Errors
///
/// Returns [`InstallError::Write`] if any step fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), InstallError> {
    let write_err = |source| InstallError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_yaml_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let value: Option<Value> = read_yaml(&dir.path().join("missing.yaml")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/file.txt");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        // Only the target file remains; the temporary file was renamed.
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_upsert_yaml_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.yaml");
        std::fs::write(&path, "region: us-east-1\naws_profile: prod\n").unwrap();

        let mut values = Mapping::new();
        values.insert("sla_target".into(), 2.into());
        values.insert("region".into(), "us-west-2".into());
        upsert_yaml(&path, values).unwrap();

        let mapping = read_yaml_mapping(&path).unwrap();
        assert_eq!(mapping.get("aws_profile"), Some(&Value::from("prod")));
        assert_eq!(mapping.get("region"), Some(&Value::from("us-west-2")));
        assert_eq!(mapping.get("sla_target"), Some(&Value::from(2)));
    }

    #[test]
    fn test_read_yaml_mapping_rejects_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.yaml");
        std::fs::write(&path, "- a\n- b\n").unwrap();
        assert!(matches!(
            read_yaml_mapping(&path),
            Err(InstallError::Parse { .. })
        ));
    }
}
