use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tracing::{info, warn};

use super::{Config, ConfigError};

/// Process-wide configuration shared by every component.
///
/// Components call [`ConfigStore::snapshot`] once at the start of a cycle and
/// use that `Arc<Config>` throughout, so a concurrent `set` or file reload
/// takes effect at the next cycle boundary.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
    version: AtomicU64,
    /// Key -> time of the last accepted `set` (seconds since Unix epoch).
    updated_at: Mutex<HashMap<String, i64>>,
    file_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// In-memory store with no backing file.
    pub fn new(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(1),
            updated_at: Mutex::new(HashMap::new()),
            file_mtime: Mutex::new(None),
        }
    }

    /// Loads the TOML file and remembers it for [`ConfigStore::reload_if_changed`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load(&path)?;
        let store = Self::new(config);
        *store
            .file_mtime
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = file_mtime(&path);
        Ok(Self {
            path: Some(path),
            ..store
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Incremented on every accepted change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        self.snapshot().value_of(key)
    }

    /// Parses, validates and installs one key. On error the previous value
    /// stays in effect.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let updated = guard.with_value(key, value)?;
        *guard = Arc::new(updated);
        drop(guard);

        self.version.fetch_add(1, Ordering::SeqCst);
        self.updated_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), chrono::Utc::now().timestamp());
        info!(key, value, "config updated");
        Ok(())
    }

    /// Time of the last accepted `set` for `key`, if any.
    pub fn updated_at(&self, key: &str) -> Option<i64> {
        self.updated_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    /// Replaces the whole configuration after validating it.
    pub fn replace(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Re-reads the backing file when its mtime changed.
    ///
    /// Returns `Ok(true)` when a new configuration was installed. An invalid
    /// file is reported and the running configuration is kept.
    pub fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let mtime = file_mtime(path);
        {
            let mut last = self.file_mtime.lock().unwrap_or_else(|e| e.into_inner());
            if *last == mtime {
                return Ok(false);
            }
            *last = mtime;
        }

        match Config::load(path) {
            Ok(config) => {
                self.replace(config)?;
                info!(path = %path.display(), "config reloaded");
                Ok(true)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload rejected, keeping previous");
                Err(e)
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use tempfile::tempdir;

    #[test]
    fn set_installs_value_and_bumps_version() {
        let store = ConfigStore::new(Config::default());
        let v0 = store.version();
        store.set("mode", "emergency").unwrap();
        assert_eq!(store.snapshot().mode, Mode::Emergency);
        assert_eq!(store.get("mode").unwrap(), "emergency");
        assert!(store.version() > v0);
        assert!(store.updated_at("mode").is_some());
    }

    #[test]
    fn rejected_set_keeps_prior_value() {
        let store = ConfigStore::new(Config::default());
        store.set("storm_threshold", "5").unwrap();
        let v = store.version();
        assert!(store.set("storm_threshold", "0.5").is_err());
        assert!(store.set("storm_threshold", "lots").is_err());
        assert_eq!(store.snapshot().storm_threshold, 5.0);
        assert_eq!(store.version(), v);
    }

    #[test]
    fn snapshot_is_stable_across_concurrent_set() {
        let store = ConfigStore::new(Config::default());
        let cycle_config = store.snapshot();
        store.set("ring_capacity", "200").unwrap();
        assert_eq!(cycle_config.ring_capacity, 120);
        assert_eq!(store.snapshot().ring_capacity, 200);
    }

    #[test]
    fn reload_picks_up_file_changes_and_rejects_bad_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pgflight.toml");
        std::fs::write(&path, "ring_capacity = 100\n").unwrap();

        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.snapshot().ring_capacity, 100);
        assert!(!store.reload_if_changed().unwrap());

        std::fs::write(&path, "ring_capacity = 150\nmode = \"emergency\"\n").unwrap();
        // Force a different mtime regardless of filesystem timestamp granularity.
        *store.file_mtime.lock().unwrap() = None;
        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.snapshot().ring_capacity, 150);

        std::fs::write(&path, "ring_capacity = 1\n").unwrap();
        *store.file_mtime.lock().unwrap() = None;
        assert!(store.reload_if_changed().is_err());
        assert_eq!(store.snapshot().ring_capacity, 150);
    }

    #[test]
    fn missing_file_opens_with_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("absent.toml")).unwrap();
        assert_eq!(*store.snapshot(), Config::default());
    }
}
