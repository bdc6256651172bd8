use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::models::{Device, DeviceMetadata};

type Entries = BTreeMap<String, DeviceMetadata>;

/// Persistent address → metadata map backed by a YAML file.
pub struct DeviceRegistry {
    path: Option<PathBuf>,
    entries: RwLock<Entries>,
    writer: Mutex<()>,
}

impl DeviceRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Entries::new()),
            writer: Mutex::new(()),
        }
    }

    /// Missing or unreadable files yield an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "device registry unreadable, starting empty");
                Entries::new()
            }
        };
        debug!(path = %path.display(), devices = entries.len(), "device registry loaded");
        Self {
            path: Some(path),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, address: &str) -> Option<DeviceMetadata> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    pub fn all(&self) -> Vec<Device> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(address, metadata)| Device {
                address: address.clone(),
                metadata: metadata.clone(),
            })
            .collect()
    }

    /// Returns whether the stored value changed. Unchanged writes never touch the disk.
    pub fn put(&self, address: &str, metadata: DeviceMetadata) -> Result<bool, AppError> {
        self.update(|entries| {
            if entries.get(address) == Some(&metadata) {
                return false;
            }
            entries.insert(address.to_string(), metadata);
            true
        })
    }

    /// Inserts only when `address` has no entry yet; the check and the insert share the
    /// writer lock, so a concurrent `put` is never overwritten.
    pub fn put_if_absent(&self, address: &str, metadata: DeviceMetadata) -> Result<bool, AppError> {
        self.update(|entries| {
            if entries.contains_key(address) {
                return false;
            }
            entries.insert(address.to_string(), metadata);
            true
        })
    }

    pub fn remove(&self, address: &str) -> Result<bool, AppError> {
        self.update(|entries| entries.remove(address).is_some())
    }

    fn update(&self, mutate: impl FnOnce(&mut Entries) -> bool) -> Result<bool, AppError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !mutate(&mut next) {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            write_entries(path, &next)?;
            debug!(path = %path.display(), devices = next.len(), "device registry saved");
        }
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(true)
    }
}

fn read_entries(path: &Path) -> Result<Entries, String> {
    if !path.exists() {
        return Ok(Entries::new());
    }
    let raw = fs::read_to_string(path).map_err(|err| format!("Failed to read registry: {err}"))?;
    if raw.trim().is_empty() {
        return Ok(Entries::new());
    }
    serde_yaml::from_str(&raw).map_err(|err| format!("Failed to parse registry: {err}"))
}

/// Writes next to the target and renames over it, so readers see old or new, never half.
fn write_entries(path: &Path, entries: &Entries) -> Result<(), AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .map_err(|err| AppError::system(format!("Failed to create registry dir: {err}"), ""))?;
    let payload = serde_yaml::to_string(entries)
        .map_err(|err| AppError::system(format!("Failed to serialize registry: {err}"), ""))?;
    let mut file = NamedTempFile::new_in(&parent)
        .map_err(|err| AppError::system(format!("Failed to create temp registry: {err}"), ""))?;
    file.write_all(payload.as_bytes())
        .and_then(|_| file.as_file().sync_all())
        .map_err(|err| AppError::system(format!("Failed to write registry: {err}"), ""))?;
    file.persist(path)
        .map_err(|err| AppError::system(format!("Failed to replace registry: {err}"), ""))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pixel() -> DeviceMetadata {
        DeviceMetadata {
            model: "Pixel 7".to_string(),
            brand: "google".to_string(),
            os_version: "14".to_string(),
        }
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("devices.yaml");
        let registry = DeviceRegistry::load(&path);
        assert!(registry.put("10.0.0.5:5555", pixel()).expect("first put"));
        let first = fs::read_to_string(&path).expect("file");
        assert!(!registry.put("10.0.0.5:5555", pixel()).expect("second put"));
        assert_eq!(fs::read_to_string(&path).expect("file"), first);
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn reload_round_trips_entries() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("nested").join("devices.yaml");
        let registry = DeviceRegistry::load(&path);
        registry.put("b-device", pixel()).expect("put");
        registry.put("a-device", DeviceMetadata::default()).expect("put");

        let reloaded = DeviceRegistry::load(&path);
        let all = reloaded.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].address, "a-device");
        assert_eq!(reloaded.get("b-device"), Some(pixel()));
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("devices.yaml");
        fs::write(&path, "devices: [unterminated").expect("write");
        let registry = DeviceRegistry::load(&path);
        assert!(registry.all().is_empty());
        registry.put("dev1", pixel()).expect("put");
        assert_eq!(DeviceRegistry::load(&path).get("dev1"), Some(pixel()));
    }

    #[test]
    fn put_if_absent_keeps_existing_metadata() {
        let registry = DeviceRegistry::in_memory();
        registry.put("10.0.0.5:5555", pixel()).expect("put");
        assert!(!registry
            .put_if_absent("10.0.0.5:5555", DeviceMetadata::default())
            .expect("put_if_absent"));
        assert_eq!(registry.get("10.0.0.5:5555"), Some(pixel()));
        assert!(registry
            .put_if_absent("10.0.0.6:5555", DeviceMetadata::default())
            .expect("put_if_absent"));
        assert_eq!(registry.get("10.0.0.6:5555"), Some(DeviceMetadata::default()));
    }

    #[test]
    fn remove_deletes_entry() {
        let registry = DeviceRegistry::in_memory();
        registry.put("dev1", pixel()).expect("put");
        assert!(registry.remove("dev1").expect("remove"));
        assert!(!registry.remove("dev1").expect("remove again"));
        assert_eq!(registry.get("dev1"), None);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("devices.yaml");
        let registry = Arc::new(DeviceRegistry::load(&path));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.put(&format!("dev{n}"), pixel()).expect("put"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(DeviceRegistry::load(&path).all().len(), 8);
    }
}
