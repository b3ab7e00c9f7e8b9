//! The chunk-store seam between dagdb and its storage engine.
//!
//! A chunk store holds content-addressed chunks plus a single root [`Head`]
//! naming the current state. Stores are consumed through `Arc<dyn ChunkStore>`
//! so the server code is agnostic to whether the other end is the local
//! engine, an in-memory test double, or a remote standby client.

use crate::hash::Head;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by chunk store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The other end of a remote store could not be reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// A chunk referenced by the requested heads is absent from the source.
    #[error("missing chunk {0}")]
    MissingChunk(Head),

    /// The store has been closed (its database was dropped).
    #[error("chunk store is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for engine-specific failures.
    #[error("{0}")]
    Other(String),
}

/// A content-addressed chunk: opaque payload plus the heads it references.
///
/// The references are what make the transitive closure walkable without
/// decoding payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    hash: Head,
    refs: Vec<Head>,
    data: Vec<u8>,
}

impl Chunk {
    /// Build a chunk; its hash covers both the payload and the references.
    pub fn new(data: Vec<u8>, refs: Vec<Head>) -> Chunk {
        let mut buf = Vec::with_capacity(data.len() + refs.len() * 20);
        for r in &refs {
            buf.extend_from_slice(r.as_bytes());
        }
        buf.extend_from_slice(&data);
        Chunk {
            hash: Head::of(&buf),
            refs,
            data,
        }
    }

    pub fn hash(&self) -> Head {
        self.hash
    }

    pub fn refs(&self) -> &[Head] {
        &self.refs
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Content-addressed chunk storage with a single mutable root.
///
/// `commit` is the only mutation of the root and is atomic: it succeeds only
/// when the store's current root still equals `expected`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Current root of the store. Zero if nothing has been committed.
    async fn root(&self) -> Result<Head, StoreError>;

    /// Refresh this client's view of the store's root.
    async fn rebase(&self) -> Result<(), StoreError>;

    /// Atomically advance the root from `expected` to `new`.
    ///
    /// Returns `Ok(false)` without changing anything when the current root
    /// differs from `expected`.
    async fn commit(&self, new: Head, expected: Head) -> Result<bool, StoreError>;

    /// Whether the chunk named by `hash` is present.
    async fn has_chunk(&self, hash: Head) -> Result<bool, StoreError>;

    /// Fetch a chunk; `Ok(None)` when absent.
    async fn get_chunk(&self, hash: Head) -> Result<Option<Chunk>, StoreError>;

    /// Store a chunk.
    async fn put_chunk(&self, chunk: Chunk) -> Result<(), StoreError>;

    /// Copy the transitive closure of chunks reachable from `heads` out of
    /// `src` into this store. `temp_dir` is scratch space for engines that
    /// spool table files; in-memory stores ignore it.
    async fn pull_chunks(
        &self,
        temp_dir: &Path,
        src: Arc<dyn ChunkStore>,
        heads: &[Head],
    ) -> Result<(), StoreError> {
        let _ = temp_dir;
        let mut pending: Vec<Head> = heads.iter().copied().filter(|h| !h.is_empty()).collect();
        let mut fetched: Vec<Chunk> = Vec::new();
        while let Some(h) = pending.pop() {
            if self.has_chunk(h).await? || fetched.iter().any(|c| c.hash() == h) {
                continue;
            }
            let chunk = src
                .get_chunk(h)
                .await?
                .ok_or(StoreError::MissingChunk(h))?;
            pending.extend_from_slice(chunk.refs());
            fetched.push(chunk);
        }
        // Parents are discovered before their children, so writing in reverse
        // keeps the store closed under references at every point.
        for chunk in fetched.into_iter().rev() {
            self.put_chunk(chunk).await?;
        }
        Ok(())
    }
}
