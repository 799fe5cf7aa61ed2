//! Device-local backends.
//!
//! [`MemoryLocalBackend`] lives for the process; [`FileLocalBackend`] keeps
//! a JSON object on disk and rewrites it after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use satchel_core::{SatchelError, SatchelResult};
use tracing::debug;

use super::traits::LocalBackend;

#[derive(Debug, Default)]
pub struct MemoryLocalBackend {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryLocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalBackend for MemoryLocalBackend {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> SatchelResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SatchelResult<Option<String>> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        Ok(values.remove(key))
    }

    fn keys(&self) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.keys().cloned().collect()
    }
}

/// JSON file on disk.
#[derive(Debug)]
pub struct FileLocalBackend {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileLocalBackend {
    /// Open the file at `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> SatchelResult<Self> {
        let path = path.into();
        let values = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| local_error(&path, e))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents).map_err(|e| local_error(&path, e))?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = values.len(), "Opened device store");
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> SatchelResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| local_error(&self.path, e))?;
            }
        }
        let contents =
            serde_json::to_string_pretty(values).map_err(|e| local_error(&self.path, e))?;
        std::fs::write(&self.path, contents).map_err(|e| local_error(&self.path, e))
    }
}

fn local_error(path: &Path, err: impl std::fmt::Display) -> SatchelError {
    SatchelError::Local {
        reason: format!("{}: {}", path.display(), err),
    }
}

impl LocalBackend for FileLocalBackend {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> SatchelResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> SatchelResult<Option<String>> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        let previous = values.remove(key);
        if previous.is_some() {
            self.save(&values)?;
        }
        Ok(previous)
    }

    fn keys(&self) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_set_get_remove() {
        let backend = MemoryLocalBackend::new();
        backend.set("theme", "dark").unwrap();
        assert_eq!(backend.get("theme").as_deref(), Some("dark"));
        assert_eq!(backend.keys(), vec!["theme".to_string()]);
        assert_eq!(backend.remove("theme").unwrap().as_deref(), Some("dark"));
        assert_eq!(backend.get("theme"), None);
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device.json");

        {
            let backend = FileLocalBackend::open(&path).unwrap();
            backend.set("royal-academy-ui-theme", "\"dark\"").unwrap();
            backend.set("sb-access-token", "abc").unwrap();
            backend.remove("sb-access-token").unwrap();
        }

        let reopened = FileLocalBackend::open(&path).unwrap();
        assert_eq!(
            reopened.get("royal-academy-ui-theme").as_deref(),
            Some("\"dark\"")
        );
        assert_eq!(reopened.get("sb-access-token"), None);
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_file_backend_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileLocalBackend::open(&path).unwrap_err();
        assert!(matches!(err, SatchelError::Local { .. }));
    }

    #[test]
    fn test_file_backend_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, "").unwrap();

        let backend = FileLocalBackend::open(&path).unwrap();
        assert!(backend.keys().is_empty());
    }
}
