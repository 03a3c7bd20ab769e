//! Content-addressed, deduplicating chunk storage: the filesystem-backed
//! blob store, the concurrent ingest pipeline that feeds it, streamed
//! reconstruction of files from their manifests, and reference-counted
//! garbage collection on delete.
//!
//! This crate knows nothing about HTTP or any particular database driver.
//! It defines narrow traits ([`ingest::ChunkIndex`], [`ingest::ManifestSink`],
//! [`stream::FileLookup`], [`gc::DeletionIndex`]) for the relational state it
//! needs, and leaves implementing them to the caller.

pub mod chunk_store;
pub mod error;
pub mod gc;
pub mod hash;
pub mod ingest;
pub mod stream;

pub use chunk_store::ChunkStore;
pub use error::{Error, Result};
pub use gc::{DeletionIndex, GarbageCollector, GcResult};
pub use ingest::{ChunkIndex, IngestConfig, IngestPipeline, IngestStats, ManifestEntry, ManifestSink};
pub use stream::{FileLookup, StreamAssembler};
