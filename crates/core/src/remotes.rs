//! Remote databases: names, URL templates, and store factories.
//!
//! Replication configuration names remotes by URL. The scheme of the URL
//! picks a [`RemoteFactory`] out of the registry; the factory dials the
//! remote and hands back a chunk-store client. Opened stores are memoized in
//! a [`ChunkStoreCache`] so a database that is dropped and re-created does
//! not observe a stale client; the provider evicts its entry on drop.

use crate::chunkstore::{ChunkStore, StoreError};
use crate::memory::MemoryChunkStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Placeholder replaced with the database name when expanding
/// `replication_remote_url_template`.
pub const URL_TEMPLATE_DATABASE_PLACEHOLDER: &str = "{database}";

/// A named remote endpoint for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Remote {
        Remote {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Expand a remote URL template, substituting every occurrence of
/// [`URL_TEMPLATE_DATABASE_PLACEHOLDER`] with `database`.
pub fn expand_url_template(template: &str, database: &str) -> String {
    template.replace(URL_TEMPLATE_DATABASE_PLACEHOLDER, database)
}

/// Dials one URL scheme into a chunk-store client.
#[async_trait]
pub trait RemoteFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn ChunkStore>, StoreError>;
}

/// Memoized chunk-store clients keyed by URL or local path.
#[derive(Default)]
pub struct ChunkStoreCache {
    inner: RwLock<HashMap<String, Arc<dyn ChunkStore>>>,
}

impl ChunkStoreCache {
    pub fn new() -> ChunkStoreCache {
        ChunkStoreCache::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ChunkStore>> {
        self.inner.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, store: Arc<dyn ChunkStore>) {
        self.inner.write().insert(key.into(), store);
    }

    /// Drop the cached client for `key`, if any. Called when the backing
    /// database is dropped so a re-created database starts fresh.
    pub fn evict(&self, key: &str) {
        self.inner.write().remove(key);
    }
}

/// Scheme-keyed registry of remote factories, with an opened-store cache.
#[derive(Default)]
pub struct RemoteFactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn RemoteFactory>>>,
    cache: ChunkStoreCache,
}

impl RemoteFactoryRegistry {
    pub fn new() -> RemoteFactoryRegistry {
        RemoteFactoryRegistry::default()
    }

    /// Register the factory handling `scheme` (the part before `://`).
    pub fn register(&self, scheme: impl Into<String>, factory: Arc<dyn RemoteFactory>) {
        self.factories.write().insert(scheme.into(), factory);
    }

    /// Open (or reuse) a chunk-store client for `url`.
    pub async fn open(&self, url: &str) -> Result<Arc<dyn ChunkStore>, StoreError> {
        if let Some(store) = self.cache.get(url) {
            return Ok(store);
        }
        let scheme = url
            .split_once("://")
            .map(|(s, _)| s)
            .ok_or_else(|| StoreError::Unreachable(format!("malformed remote url: {url}")))?;
        let factory = self
            .factories
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| {
                StoreError::Unreachable(format!("no remote factory registered for scheme: {scheme}"))
            })?;
        let store = factory.open(url).await?;
        self.cache.insert(url, store.clone());
        Ok(store)
    }

    pub fn cache(&self) -> &ChunkStoreCache {
        &self.cache
    }
}

/// Factory for `mem://` remotes: every distinct URL maps to its own
/// in-memory store, created on first open and shared thereafter.
///
/// Tests use this as the standby side; [`MemRemoteFactory::store_for`] gives
/// them direct access to seed or inspect it.
#[derive(Default)]
pub struct MemRemoteFactory {
    stores: Mutex<HashMap<String, Arc<MemoryChunkStore>>>,
}

impl MemRemoteFactory {
    pub fn new() -> MemRemoteFactory {
        MemRemoteFactory::default()
    }

    /// The store backing `url`, created if absent.
    pub fn store_for(&self, url: &str) -> Arc<MemoryChunkStore> {
        self.stores
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryChunkStore::new()))
            .clone()
    }
}

#[async_trait]
impl RemoteFactory for MemRemoteFactory {
    async fn open(&self, url: &str) -> Result<Arc<dyn ChunkStore>, StoreError> {
        Ok(self.store_for(url))
    }
}
