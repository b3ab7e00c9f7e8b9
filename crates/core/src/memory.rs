//! In-memory chunk store.
//!
//! Backs freshly created databases until a durable engine is wired in, serves
//! as the `mem://` remote in tests, and doubles as the standby side of the
//! cluster tests. All state lives behind one `parking_lot::Mutex`; none of
//! the async trait methods ever block.

use crate::chunkstore::{Chunk, ChunkStore, StoreError};
use crate::hash::Head;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    chunks: HashMap<Head, Chunk>,
    root: Head,
    closed: bool,
}

/// A chunk store held entirely in memory.
#[derive(Default)]
pub struct MemoryChunkStore {
    inner: Mutex<Inner>,
}

impl MemoryChunkStore {
    pub fn new() -> MemoryChunkStore {
        MemoryChunkStore::default()
    }

    /// Mark the store closed; every subsequent operation fails with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Number of chunks currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    fn check_open(inner: &Inner) -> Result<(), StoreError> {
        if inner.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn root(&self) -> Result<Head, StoreError> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner.root)
    }

    async fn rebase(&self) -> Result<(), StoreError> {
        // The in-memory store has no stale client view to refresh.
        Self::check_open(&self.inner.lock())
    }

    async fn commit(&self, new: Head, expected: Head) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if inner.root != expected {
            return Ok(false);
        }
        inner.root = new;
        Ok(true)
    }

    async fn has_chunk(&self, hash: Head) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner.chunks.contains_key(&hash))
    }

    async fn get_chunk(&self, hash: Head) -> Result<Option<Chunk>, StoreError> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner.chunks.get(&hash).cloned())
    }

    async fn put_chunk(&self, chunk: Chunk) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.chunks.insert(chunk.hash(), chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_commit_is_compare_and_swap() {
        let store = MemoryChunkStore::new();
        let h1 = Head::of(b"one");
        let h2 = Head::of(b"two");

        assert!(store.commit(h1, Head::EMPTY).await.unwrap());
        assert_eq!(store.root().await.unwrap(), h1);

        // Stale expectation is refused without moving the root.
        assert!(!store.commit(h2, Head::EMPTY).await.unwrap());
        assert_eq!(store.root().await.unwrap(), h1);

        assert!(store.commit(h2, h1).await.unwrap());
        assert_eq!(store.root().await.unwrap(), h2);
    }

    #[tokio::test]
    async fn test_pull_chunks_copies_transitive_closure() {
        let src = Arc::new(MemoryChunkStore::new());
        let leaf = Chunk::new(b"leaf".to_vec(), vec![]);
        let mid = Chunk::new(b"mid".to_vec(), vec![leaf.hash()]);
        let top = Chunk::new(b"top".to_vec(), vec![mid.hash(), leaf.hash()]);
        for c in [&leaf, &mid, &top] {
            src.put_chunk(c.clone()).await.unwrap();
        }

        let dest = MemoryChunkStore::new();
        let src_dyn: Arc<dyn ChunkStore> = src.clone();
        dest.pull_chunks(Path::new("/tmp"), src_dyn, &[top.hash()])
            .await
            .unwrap();

        assert_eq!(dest.len(), 3);
        assert_eq!(
            dest.get_chunk(leaf.hash()).await.unwrap(),
            Some(leaf.clone())
        );
    }

    #[tokio::test]
    async fn test_pull_chunks_missing_source_chunk() {
        let src: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let dest = MemoryChunkStore::new();
        let absent = Head::of(b"nowhere");
        let err = dest
            .pull_chunks(Path::new("/tmp"), src, &[absent])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingChunk(h) if h == absent));
    }

    #[tokio::test]
    async fn test_closed_store_refuses_everything() {
        let store = MemoryChunkStore::new();
        store.close();
        assert!(matches!(store.root().await, Err(StoreError::Closed)));
        assert!(matches!(
            store.commit(Head::of(b"h"), Head::EMPTY).await,
            Err(StoreError::Closed)
        ));
    }
}
