use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};
use tracing::debug;

/// Which peripheral a cache slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralKind {
    /// The fitness machine slot
    FitnessMachine,
    /// The heart rate monitor slot
    HeartRate,
}

impl PeripheralKind {
    const fn file_name(self) -> &'static str {
        match self {
            Self::FitnessMachine => "fitness_machine.json",
            Self::HeartRate => "heart_rate.json",
        }
    }
}

/// A remembered device, enough to reconnect without a user-driven scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDeviceRef {
    /// Platform peripheral identifier
    pub id: String,
    /// Advertised name at the time of caching
    pub name: String,
    /// When the device was last connected
    pub cached_at: SystemTime,
}

/// Storage for remembered devices, one slot per peripheral kind
pub trait DeviceCache: Send + Sync {
    /// Load the remembered device for a slot, if any
    ///
    /// # Errors
    ///
    /// Returns an I/O error or [`crate::FitlinkError::CacheFormat`] on
    /// unreadable contents.
    fn load(&self, kind: PeripheralKind) -> Result<Option<CachedDeviceRef>>;

    /// Remember a device in a slot, replacing any previous entry
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the slot cannot be written.
    fn store(&self, kind: PeripheralKind, device: &CachedDeviceRef) -> Result<()>;

    /// Clear a slot
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the slot cannot be removed.
    fn clear(&self, kind: PeripheralKind) -> Result<()>;
}

/// File-backed cache, one JSON file per slot under a directory
pub struct FileDeviceCache {
    dir: PathBuf,
}

impl FileDeviceCache {
    /// Create a cache rooted at the given directory, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path(&self, kind: PeripheralKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

impl DeviceCache for FileDeviceCache {
    fn load(&self, kind: PeripheralKind) -> Result<Option<CachedDeviceRef>> {
        let path = self.path(kind);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let device = serde_json::from_str(&contents)?;
        Ok(Some(device))
    }

    fn store(&self, kind: PeripheralKind, device: &CachedDeviceRef) -> Result<()> {
        let path = self.path(kind);
        debug!(?kind, name = %device.name, "caching device");
        fs::write(&path, serde_json::to_string_pretty(device)?)?;
        Ok(())
    }

    fn clear(&self, kind: PeripheralKind) -> Result<()> {
        let path = self.path(kind);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// In-memory cache, useful for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryDeviceCache {
    slots: Mutex<HashMap<PeripheralKind, CachedDeviceRef>>,
}

impl DeviceCache for MemoryDeviceCache {
    fn load(&self, kind: PeripheralKind) -> Result<Option<CachedDeviceRef>> {
        Ok(self
            .slots
            .lock()
            .map(|slots| slots.get(&kind).cloned())
            .unwrap_or(None))
    }

    fn store(&self, kind: PeripheralKind, device: &CachedDeviceRef) -> Result<()> {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(kind, device.clone());
        }
        Ok(())
    }

    fn clear(&self, kind: PeripheralKind) -> Result<()> {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(&kind);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> CachedDeviceRef {
        CachedDeviceRef {
            id: "hci0/dev_AA_BB_CC_DD_EE_FF".to_string(),
            name: name.to_string(),
            cached_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDeviceCache::new(dir.path()).unwrap();

        assert_eq!(cache.load(PeripheralKind::FitnessMachine).unwrap(), None);

        let device = sample("KICKR CORE 1234");
        cache
            .store(PeripheralKind::FitnessMachine, &device)
            .unwrap();
        assert_eq!(
            cache.load(PeripheralKind::FitnessMachine).unwrap(),
            Some(device)
        );

        // the other slot is untouched
        assert_eq!(cache.load(PeripheralKind::HeartRate).unwrap(), None);

        cache.clear(PeripheralKind::FitnessMachine).unwrap();
        assert_eq!(cache.load(PeripheralKind::FitnessMachine).unwrap(), None);
    }

    #[test]
    fn test_file_cache_store_replaces_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDeviceCache::new(dir.path()).unwrap();

        cache
            .store(PeripheralKind::HeartRate, &sample("HRM-Dual"))
            .unwrap();
        cache
            .store(PeripheralKind::HeartRate, &sample("Polar H10"))
            .unwrap();

        let loaded = cache.load(PeripheralKind::HeartRate).unwrap().unwrap();
        assert_eq!(loaded.name, "Polar H10");
    }

    #[test]
    fn test_file_cache_rejects_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDeviceCache::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("fitness_machine.json"), "not json").unwrap();
        assert!(cache.load(PeripheralKind::FitnessMachine).is_err());
    }

    #[test]
    fn test_memory_cache_round_trip() {
        let cache = MemoryDeviceCache::default();
        let device = sample("Suito-T");

        cache.store(PeripheralKind::FitnessMachine, &device).unwrap();
        assert_eq!(
            cache.load(PeripheralKind::FitnessMachine).unwrap(),
            Some(device)
        );
        cache.clear(PeripheralKind::FitnessMachine).unwrap();
        assert_eq!(cache.load(PeripheralKind::FitnessMachine).unwrap(), None);
    }
}
