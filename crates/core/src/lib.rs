//! dagdb-core: storage contracts for dagdb.
//!
//! A dagdb database is a content-addressed DAG of chunks whose current state
//! is named by a single 20-byte root [`Head`]. This crate defines the pieces
//! the server builds on: the [`ChunkStore`] seam over the storage engine, the
//! named [`Db`] handle with its on-disk refs metadata, remote URL handling,
//! and the commit-hook contract invoked after local writes land.

/// Chunk store trait, chunk graph types, and store errors.
pub mod chunkstore;
/// Global tuning constants and on-disk layout names.
pub mod config;
/// Named database handle: refs metadata, commit hooks, directory layout.
pub mod db;
/// The 20-byte content-addressed root hash.
pub mod hash;
/// In-memory chunk store.
pub mod memory;
/// Remote names/URLs, the URL template, and the store factory registry.
pub mod remotes;

pub use chunkstore::{Chunk, ChunkStore, StoreError};
pub use db::{CommitHook, CommitWait, Db, DbError};
pub use hash::{is_valid_commit_hash, Head};
pub use memory::MemoryChunkStore;
pub use remotes::{
    expand_url_template, ChunkStoreCache, Remote, RemoteFactory, RemoteFactoryRegistry,
};
