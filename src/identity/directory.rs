use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::crypto::identity::ExportedKey;
use crate::errors::{GistError, Result};
use crate::identity::handle::IdentityHandle;

/// Public directory record for one identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: IdentityHandle,
    /// SPKI of the RSA-OAEP identity key.
    pub public_key: ExportedKey,
    /// SPKI of the RSA-PSS signing key, when the identity has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<ExportedKey>,
    pub created_at: DateTime<Utc>,
}

/// Where public identities are published and looked up.
///
/// The store owns uniqueness: `put_profile` for an existing handle fails
/// with [`GistError::IdentityTaken`]. Any other write failure is reported as
/// [`GistError::Publish`].
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_profile(&self, handle: &IdentityHandle) -> Result<Option<UserIdentity>>;

    async fn put_profile(&self, profile: UserIdentity) -> Result<()>;

    /// Look up a handle as a user typed it. Surrounding whitespace is
    /// dropped and letters are upper-cased, so `a1` finds `A1`.
    async fn search(&self, query: &str) -> Result<Option<UserIdentity>> {
        let handle = IdentityHandle::parse(&query.trim().to_ascii_uppercase())?;
        self.get_profile(&handle).await
    }
}

/// Directory held in process memory.
#[derive(Default)]
pub struct MemoryDirectory {
    profiles: RwLock<HashMap<IdentityHandle, UserIdentity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_profile(&self, handle: &IdentityHandle) -> Result<Option<UserIdentity>> {
        Ok(self.profiles.read().await.get(handle).cloned())
    }

    async fn put_profile(&self, profile: UserIdentity) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&profile.user_id) {
            return Err(GistError::IdentityTaken(profile.user_id.to_string()));
        }
        profiles.insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

/// Directory kept as one JSON object (`{ "A1": {...}, ... }`) on disk,
/// the same shape as the shared `directory.json` file.
pub struct FileDirectory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDirectory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<IdentityHandle, UserIdentity>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) if data.is_empty() => Ok(BTreeMap::new()),
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| GistError::Directory(format!("corrupt directory file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(GistError::Directory(e.to_string())),
        }
    }

    async fn store(&self, profiles: &BTreeMap<IdentityHandle, UserIdentity>) -> Result<()> {
        let publish = |e: std::io::Error| GistError::Publish(e.to_string());
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(publish)?;
        }
        let json = serde_json::to_vec_pretty(profiles).map_err(|e| GistError::Publish(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(publish)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(publish)?;
        Ok(())
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn get_profile(&self, handle: &IdentityHandle) -> Result<Option<UserIdentity>> {
        Ok(self.load().await?.remove(handle))
    }

    async fn put_profile(&self, profile: UserIdentity) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.load().await?;
        if profiles.contains_key(&profile.user_id) {
            return Err(GistError::IdentityTaken(profile.user_id.to_string()));
        }
        debug!(handle = %profile.user_id, path = %self.path.display(), "publishing profile");
        profiles.insert(profile.user_id.clone(), profile);
        self.store(&profiles).await
    }
}

/// Read-through cache in front of a slow directory.
///
/// Lookups (hits and misses) are remembered for `ttl`; a successful
/// `put_profile` drops the cached answer for that handle.
pub struct CachedDirectory<D> {
    inner: D,
    ttl: Duration,
    entries: RwLock<HashMap<IdentityHandle, (Instant, Option<UserIdentity>)>>,
}

impl<D: Directory> CachedDirectory<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl<D: Directory> Directory for CachedDirectory<D> {
    async fn get_profile(&self, handle: &IdentityHandle) -> Result<Option<UserIdentity>> {
        if let Some((fetched_at, cached)) = self.entries.read().await.get(handle) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }

        let fresh = self.inner.get_profile(handle).await?;
        self.entries
            .write()
            .await
            .insert(handle.clone(), (Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    async fn put_profile(&self, profile: UserIdentity) -> Result<()> {
        let handle = profile.user_id.clone();
        let result = self.inner.put_profile(profile).await;
        self.entries.write().await.remove(&handle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn profile(handle: &str) -> UserIdentity {
        UserIdentity {
            user_id: IdentityHandle::parse(handle).unwrap(),
            public_key: ExportedKey::new("MIIBIjAN"),
            signing_key: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_directory_uniqueness() {
        let dir = MemoryDirectory::new();
        dir.put_profile(profile("A1")).await.unwrap();
        let err = dir.put_profile(profile("A1")).await.unwrap_err();
        assert!(matches!(err, GistError::IdentityTaken(h) if h == "A1"));
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_search_normalizes_case() {
        let dir = MemoryDirectory::new();
        dir.put_profile(profile("A1")).await.unwrap();

        for query in ["A1", "a1", " a1 "] {
            let found = dir.search(query).await.unwrap();
            assert_eq!(found.map(|p| p.user_id.to_string()).as_deref(), Some("A1"), "{query:?}");
        }
        assert_eq!(dir.search("b7").await.unwrap(), None);
        assert!(matches!(dir.search("ab1").await, Err(GistError::Validation(_))));
        // Registration-side parsing stays strict.
        assert!(IdentityHandle::parse("a1").is_err());
    }

    #[tokio::test]
    async fn test_file_directory_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("directory.json");
        let a1 = profile("A1");

        FileDirectory::new(&path).put_profile(a1.clone()).await.unwrap();

        let reopened = FileDirectory::new(&path);
        let handle = IdentityHandle::parse("A1").unwrap();
        assert_eq!(reopened.get_profile(&handle).await.unwrap(), Some(a1));
        assert!(matches!(
            reopened.put_profile(profile("A1")).await,
            Err(GistError::IdentityTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_file_directory_wire_shape() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("directory.json");
        FileDirectory::new(&path).put_profile(profile("B42")).await.unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["B42"]["userId"], "B42");
        assert_eq!(raw["B42"]["publicKey"], "MIIBIjAN");
        assert!(raw["B42"].get("signingKey").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let dir = FileDirectory::new(temp.path().join("none.json"));
        let handle = IdentityHandle::parse("C3").unwrap();
        assert_eq!(dir.get_profile(&handle).await.unwrap(), None);
    }

    struct CountingDirectory {
        inner: MemoryDirectory,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Directory for CountingDirectory {
        async fn get_profile(&self, handle: &IdentityHandle) -> Result<Option<UserIdentity>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_profile(handle).await
        }

        async fn put_profile(&self, profile: UserIdentity) -> Result<()> {
            self.inner.put_profile(profile).await
        }
    }

    #[tokio::test]
    async fn test_cache_hits_and_invalidation() {
        let cached = CachedDirectory::new(
            CountingDirectory {
                inner: MemoryDirectory::new(),
                reads: AtomicUsize::new(0),
            },
            Duration::from_secs(30),
        );
        let handle = IdentityHandle::parse("D4").unwrap();

        assert_eq!(cached.get_profile(&handle).await.unwrap(), None);
        assert_eq!(cached.get_profile(&handle).await.unwrap(), None);
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 1);

        cached.put_profile(profile("D4")).await.unwrap();
        assert!(cached.get_profile(&handle).await.unwrap().is_some());
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cached = CachedDirectory::new(
            CountingDirectory {
                inner: MemoryDirectory::new(),
                reads: AtomicUsize::new(0),
            },
            Duration::ZERO,
        );
        let handle = IdentityHandle::parse("E5").unwrap();
        cached.get_profile(&handle).await.unwrap();
        cached.get_profile(&handle).await.unwrap();
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 2);
    }
}
