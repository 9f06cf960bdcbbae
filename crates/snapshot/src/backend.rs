//! Key-value backends for snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use beamdrop_transfer::validate_storage_key;

use crate::SnapshotError;

/// Durable string storage addressed by name.
pub trait KvBackend: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, SnapshotError>;
    fn set(&self, name: &str, value: &str) -> Result<(), SnapshotError>;
    /// Removing a missing name is not an error.
    fn delete(&self, name: &str) -> Result<(), SnapshotError>;
}

/// One JSON file per name inside a directory.
pub struct JsonDirBackend {
    dir: PathBuf,
}

impl JsonDirBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SnapshotError> {
        validate_storage_key(name).map_err(|e| SnapshotError::InvalidKey(e.to_string()))?;
        Ok(self.dir.join(format!("{name}.json")))
    }
}

impl KvBackend for JsonDirBackend {
    fn get(&self, name: &str) -> Result<Option<String>, SnapshotError> {
        let path = self.path_for(name)?;
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SnapshotError> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir)?;
        // Replaced atomically via rename.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = ?path, bytes = value.len(), "snapshot written");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SnapshotError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile backend for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBackend {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<String>, SnapshotError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SnapshotError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SnapshotError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

/// Default directory for persisted session state.
pub fn default_state_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("beamdrop").join("state"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_dir_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = JsonDirBackend::new(tmp.path().join("state"));

        assert_eq!(backend.get("session").unwrap(), None);
        backend.set("session", r#"{"a":1}"#).unwrap();
        assert_eq!(backend.get("session").unwrap().as_deref(), Some(r#"{"a":1}"#));
        assert!(tmp.path().join("state/session.json").exists());
        assert!(!tmp.path().join("state/session.json.tmp").exists());

        backend.delete("session").unwrap();
        assert_eq!(backend.get("session").unwrap(), None);
        backend.delete("session").unwrap();
    }

    #[test]
    fn json_dir_rejects_path_names() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = JsonDirBackend::new(tmp.path());
        assert!(matches!(
            backend.set("../escape", "x"),
            Err(SnapshotError::InvalidKey(_))
        ));
    }

    #[test]
    fn memory_backend() {
        let backend = MemoryBackend::new();
        backend.set("k", "v").unwrap();
        assert_eq!(backend.get("k").unwrap().as_deref(), Some("v"));
        backend.delete("k").unwrap();
        assert!(backend.get("k").unwrap().is_none());
    }
}
