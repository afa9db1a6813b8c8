//! Durable settings store
//!
//! One JSON document (`config/settings.json`) mapping a module name to that
//! module's settings object. Every write replaces the whole file through a
//! temporary file and a rename, so a crash never leaves a torn document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Key-value store of structured settings
pub struct SettingsStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
    writes: AtomicU64,
}

impl SettingsStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of writes made through this store
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Decode the settings stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self.lock().get(key).cloned();
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Raw JSON stored under `key`
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Persist `value` under `key`
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut entries = self.lock();
        let previous = entries.insert(key.to_string(), value);

        let document = serde_json::to_vec_pretty(&*entries)?;
        if let Err(e) = write_atomic(&self.path, &document, None) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(Error::Persistence(format!(
                "failed to write {:?}: {}",
                self.path, e
            )));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        log::debug!("Saved settings for {}", key);
        Ok(())
    }

    /// Load the settings under `key`, persisting `default` if there are none
    pub fn load_or_init<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.get(key) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                self.put(key, &default)?;
                Ok(default)
            }
            Err(e) => {
                log::warn!("Stored settings for {} are unreadable ({}), resetting", key, e);
                self.put(key, &default)?;
                Ok(default)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Replace `path` with `content` through a temporary file and a rename
pub(crate) fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
    }
    std::fs::rename(&tmp, path)
}

/// Write `content` to `path` only if it differs from what is there
///
/// Returns `true` if the file was written.
pub(crate) fn update_file(path: &Path, content: &str, mode: Option<u32>) -> Result<bool> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }
    write_atomic(path, content.as_bytes(), mode)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default)]
        enabled: bool,
        #[serde(default)]
        name: String,
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.get::<Sample>("openvpn").unwrap(), None);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_put_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let value = Sample {
            enabled: true,
            name: "corp".into(),
        };

        let store = SettingsStore::open(&path).unwrap();
        store.put("openvpn", &value).unwrap();
        assert_eq!(store.writes(), 1);

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get::<Sample>("openvpn").unwrap(), Some(value));
    }

    #[test]
    fn test_load_or_init_persists_default_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();

        let first = store.load_or_init("http_proxy", Sample::default()).unwrap();
        assert_eq!(first, Sample::default());
        assert_eq!(store.writes(), 1);

        let second = store.load_or_init("http_proxy", Sample::default()).unwrap();
        assert_eq!(second, first);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_update_file_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn.auth");
        assert!(update_file(&path, "user\npass\n", Some(0o600)).unwrap());
        assert!(!update_file(&path, "user\npass\n", Some(0o600)).unwrap());
        assert!(update_file(&path, "user\nother\n", Some(0o600)).unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
