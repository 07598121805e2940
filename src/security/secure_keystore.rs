use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroize;

const STORE_VERSION: u32 = 1;
const MAX_KEY_LEN: usize = 256;

/// Device-scoped key/value persistence.
///
/// Survives restarts, is never synced between devices, and holds only the
/// identity handle, sealed private keys and the passphrase verifier.
/// Writes of several entries are all-or-nothing.
pub trait DeviceStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write every entry, or none of them.
    fn put_many(&self, entries: &[(&str, &str)]) -> Result<()>;

    fn remove_many(&self, keys: &[&str]) -> Result<()>;

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_many(&[(key, value)])
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(anyhow::anyhow!("Invalid storage key"));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Zeroize)]
struct StoredEntry {
    value: String,
    #[zeroize(skip)]
    written_at: i64,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, StoredEntry>,
}

/// Apply `entries` to `map`, returning the map as it must look afterwards.
fn merged(map: &BTreeMap<String, StoredEntry>, entries: &[(&str, &str)]) -> Result<BTreeMap<String, StoredEntry>> {
    let now = chrono::Utc::now().timestamp();
    let mut next = map.clone();
    for (key, value) in entries {
        validate_key(key)?;
        if let Some(mut old) = next.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                written_at: now,
            },
        ) {
            old.zeroize();
        }
    }
    Ok(next)
}

/// Swap in `next` and wipe every value of the map it replaces.
fn replace_wiped(map: &mut BTreeMap<String, StoredEntry>, next: BTreeMap<String, StoredEntry>) {
    let mut old = std::mem::replace(map, next);
    wipe(&mut old);
}

fn wipe(map: &mut BTreeMap<String, StoredEntry>) {
    map.values_mut().for_each(Zeroize::zeroize);
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow::anyhow!("device storage mutex poisoned"))
}

/// Volatile storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryDeviceStorage {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl MemoryDeviceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries)?.keys().cloned().collect())
    }
}

impl DeviceStorage for MemoryDeviceStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries)?.get(key).map(|e| e.value.clone()))
    }

    fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut map = lock(&self.entries)?;
        let next = merged(&map, entries)?;
        replace_wiped(&mut map, next);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut map = lock(&self.entries)?;
        for key in keys {
            if let Some(mut old) = map.remove(*key) {
                old.zeroize();
            }
        }
        Ok(())
    }
}

/// Bincode file on local disk.
///
/// Every write replaces the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new contents.
pub struct FileDeviceStorage {
    storage_path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl FileDeviceStorage {
    /// Open (or create on first write) the store at `storage_path`.
    pub fn open<P: AsRef<Path>>(storage_path: P) -> Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();

        if let Some(parent) = storage_path.parent() {
            fs::create_dir_all(parent).context("Failed to create storage directory")?;
        }

        let entries = Self::load(&storage_path)?;
        debug!(path = %storage_path.display(), entries = entries.len(), "opened device storage");

        Ok(Self {
            storage_path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, StoredEntry>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let data = fs::read(path).context("Failed to read device storage file")?;
        if data.is_empty() {
            return Ok(BTreeMap::new());
        }

        let file: StoreFile = bincode::deserialize(&data).context("Failed to deserialize device storage")?;
        if file.version != STORE_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported device storage version {}",
                file.version
            ));
        }
        Ok(file.entries)
    }

    fn save(&self, entries: &BTreeMap<String, StoredEntry>) -> Result<()> {
        let mut file = StoreFile {
            version: STORE_VERSION,
            entries: entries.clone(),
        };
        let serialized = bincode::serialize(&file);
        wipe(&mut file.entries);
        let mut data = serialized.context("Failed to serialize device storage")?;

        let tmp_path = self.storage_path.with_extension("tmp");
        let written = Self::write_private(&tmp_path, &data);
        data.zeroize();
        written?;

        fs::rename(&tmp_path, &self.storage_path).context("Failed to replace device storage file")?;
        debug!(path = %self.storage_path.display(), entries = entries.len(), "saved device storage");
        Ok(())
    }

    fn write_private(path: &Path, data: &[u8]) -> Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).context("Failed to open device storage file")?;
        file.write_all(data).context("Failed to write device storage file")?;
        file.sync_all().context("Failed to flush device storage file")?;
        Ok(())
    }
}

impl DeviceStorage for FileDeviceStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries)?.get(key).map(|e| e.value.clone()))
    }

    fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut map = lock(&self.entries)?;
        let next = merged(&map, entries)?;
        // Only adopt the new map once it is on disk.
        self.save(&next)?;
        replace_wiped(&mut map, next);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut map = lock(&self.entries)?;
        let mut next = map.clone();
        let mut removed = false;
        for key in keys {
            if let Some(mut old) = next.remove(*key) {
                old.zeroize();
                removed = true;
            }
        }
        if removed {
            if let Err(err) = self.save(&next) {
                wipe(&mut next);
                return Err(err);
            }
            replace_wiped(&mut map, next);
        } else {
            wipe(&mut next);
        }
        Ok(())
    }
}
