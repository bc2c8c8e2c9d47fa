//! Persistent IP lists
//!
//! Trust and deny share one structure: a store-backed membership set with an
//! in-memory cache and a JSON snapshot on disk. The store is checked first on
//! reads; the cache only answers when the store cannot. Writes go to cache,
//! store (no TTL) and snapshot, in that order, and optionally fire a post-add
//! hook (the deny list uses it for notifications).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::GuardResult;
use crate::store::Store;
use crate::IpEntry;

type AddHook = Box<dyn Fn(&IpEntry) + Send + Sync>;

/// Store-and-snapshot backed IP list, parameterized by key prefix, snapshot
/// path and post-add hook.
pub struct PersistentList {
    prefix: &'static str,
    path: PathBuf,
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<String, IpEntry>>,
    on_add: Option<AddHook>,
}

impl PersistentList {
    pub fn new(prefix: &'static str, path: PathBuf, store: Arc<dyn Store>) -> Self {
        Self {
            prefix,
            path,
            store,
            cache: RwLock::new(HashMap::new()),
            on_add: None,
        }
    }

    pub fn with_hook(mut self, hook: AddHook) -> Self {
        self.on_add = Some(hook);
        self
    }

    fn key(&self, ip: &str) -> String {
        format!("{}:{}", self.prefix, ip)
    }

    /// Load the snapshot file into cache and store. A missing file is not an
    /// error; a corrupt one is.
    pub async fn load(&self) -> GuardResult<()> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let entries: Vec<IpEntry> = serde_json::from_slice(&data)?;

        let mut batch = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::to_string(entry) {
                Ok(json) => batch.push((self.key(&entry.ip), json)),
                Err(err) => {
                    warn!("skipping unserializable {} entry {}: {}", self.prefix, entry.ip, err);
                }
            }
        }
        self.store.set_many(&batch).await?;

        let mut cache = self.cache.write();
        for entry in entries {
            cache.insert(entry.ip.clone(), entry);
        }
        info!("loaded {} {} entries from {:?}", cache.len(), self.prefix, self.path);

        Ok(())
    }

    /// Membership check: store first, cache as fallback.
    pub async fn contains(&self, ip: &str) -> bool {
        match self.store.exists(&self.key(ip)).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => warn!("{} lookup for {} fell back to cache: {}", self.prefix, ip, err),
        }

        self.cache.read().contains_key(ip)
    }

    /// Add an entry: cache + store (unbounded TTL) + snapshot rewrite. A
    /// snapshot write failure is returned to the caller but leaves cache and
    /// store consistent.
    pub async fn add(&self, ip: &str, reason: &str) -> GuardResult<()> {
        let entry = IpEntry {
            ip: ip.to_string(),
            reason: reason.to_string(),
            added_at: Utc::now().timestamp(),
            count: None,
            last: None,
        };

        let json = serde_json::to_string(&entry)?;
        self.store.set(&self.key(ip), &json, None).await?;

        self.cache.write().insert(ip.to_string(), entry.clone());

        self.snapshot()?;

        if let Some(hook) = &self.on_add {
            hook(&entry);
        }

        Ok(())
    }

    /// Rewrite the snapshot atomically (temp file + rename).
    fn snapshot(&self) -> GuardResult<()> {
        let entries: Vec<IpEntry> = self.cache.read().values().cloned().collect();
        let data = serde_json::to_vec_pretty(&entries)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Unconditional-allow list. Trusted IPs bypass every other check.
pub struct TrustList {
    inner: PersistentList,
}

impl TrustList {
    pub fn new(path: PathBuf, store: Arc<dyn Store>) -> Self {
        Self {
            inner: PersistentList::new("allow", path, store),
        }
    }

    pub async fn load(&self) -> GuardResult<()> {
        self.inner.load().await
    }

    pub async fn check(&self, ip: &str) -> bool {
        self.inner.contains(ip).await
    }

    pub async fn add(&self, ip: &str, reason: &str) -> GuardResult<()> {
        self.inner.add(ip, reason).await
    }
}

/// Unconditional-deny list. Additions fire the notification hook.
pub struct DenyList {
    inner: PersistentList,
}

impl DenyList {
    pub fn new(path: PathBuf, store: Arc<dyn Store>, on_add: Option<AddHook>) -> Self {
        let mut inner = PersistentList::new("deny", path, store);
        if let Some(hook) = on_add {
            inner = inner.with_hook(hook);
        }
        Self { inner }
    }

    pub async fn load(&self) -> GuardResult<()> {
        self.inner.load().await
    }

    pub async fn check(&self, ip: &str) -> bool {
        self.inner.contains(ip).await
    }

    pub async fn add(&self, ip: &str, reason: &str) -> GuardResult<()> {
        self.inner.add(ip, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "ip-sentinel-test-{}-{}-{}.json",
            name,
            std::process::id(),
            seq
        ))
    }

    #[tokio::test]
    async fn test_add_then_contains() {
        let path = temp_path("trust");
        let store = Arc::new(MemoryStore::new());
        let list = TrustList::new(path.clone(), store);

        assert!(!list.check("10.1.1.1").await);
        list.add("10.1.1.1", "office").await.unwrap();
        assert!(list.check("10.1.1.1").await);

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let path = temp_path("deny");
        let store = Arc::new(MemoryStore::new());

        let list = DenyList::new(path.clone(), store, None);
        list.add("1.2.3.4", "scanner").await.unwrap();
        list.add("5.6.7.8", "bruteforce").await.unwrap();

        // a new list over a fresh store recovers membership from the snapshot
        let fresh_store = Arc::new(MemoryStore::new());
        let reloaded = DenyList::new(path.clone(), fresh_store.clone(), None);
        reloaded.load().await.unwrap();
        assert!(reloaded.check("1.2.3.4").await);
        assert!(reloaded.check("5.6.7.8").await);
        // the load also seeded the store
        assert!(fresh_store.exists("deny:1.2.3.4").await.unwrap());

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_fine() {
        let store = Arc::new(MemoryStore::new());
        let list = TrustList::new(temp_path("missing"), store);
        assert!(list.load().await.is_ok());
    }

    #[tokio::test]
    async fn test_add_hook_fires() {
        let path = temp_path("hook");
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let list = DenyList::new(
            path.clone(),
            store,
            Some(Box::new(move |_entry| {
                counted.fetch_add(1, Ordering::Relaxed);
            })),
        );

        list.add("9.9.9.9", "abuse").await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        std::fs::remove_file(path).ok();
    }
}
