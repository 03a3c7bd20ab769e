//! Staged concurrent ingest pipeline: split -> hash -> store -> manifest batch.
//!
//! Four stages connected by bounded queues. A single cancellation token and
//! a size-1 error channel give first-error-wins semantics: whichever stage
//! fails first cancels its peers, and the pipeline surfaces that error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::error::{Error, Result};
use crate::hash::digest_hex;

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub batch_size: usize,
    pub store_workers: usize,
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            batch_size: 200,
            store_workers: 10,
            queue_depth: 8,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct IngestStats {
    pub total_size: u64,
    pub chunks_count: u64,
    pub unique_chunks_written: u64,
    pub dedupe_saved_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub idx: u64,
    pub hash: String,
    pub size: u64,
}

/// What the pipeline needs from the chunk metadata table. Implemented by the
/// relational index so this crate stays free of any particular database
/// driver.
#[async_trait::async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Inserts the chunk row if absent. Returns whether it was newly inserted.
    async fn upsert_chunk(&self, hash: &str, size: u64) -> Result<bool>;
}

/// What the pipeline needs to persist manifest entries.
#[async_trait::async_trait]
pub trait ManifestSink: Send + Sync {
    async fn add_manifest_batch(&self, file_id: Uuid, entries: &[ManifestEntry]) -> Result<()>;
}

struct SplitChunk {
    idx: u64,
    bytes: Vec<u8>,
}

struct HashedChunk {
    idx: u64,
    bytes: Vec<u8>,
    hash: String,
}

struct StoredChunk {
    idx: u64,
    hash: String,
    size: u64,
    reused: bool,
}

pub struct IngestPipeline {
    chunk_store: Arc<ChunkStore>,
    chunk_index: Arc<dyn ChunkIndex>,
    manifest_sink: Arc<dyn ManifestSink>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        chunk_store: Arc<ChunkStore>,
        chunk_index: Arc<dyn ChunkIndex>,
        manifest_sink: Arc<dyn ManifestSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            chunk_store,
            chunk_index,
            manifest_sink,
            config,
        }
    }

    pub async fn run<R>(&self, file_id: Uuid, mut reader: R) -> Result<IngestStats>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        let (chunk_tx, chunk_rx) = mpsc::channel::<SplitChunk>(self.config.queue_depth);
        let (hashed_tx, hashed_rx) = mpsc::channel::<HashedChunk>(self.config.queue_depth);
        let (stored_tx, mut stored_rx) = mpsc::channel::<StoredChunk>(self.config.queue_depth);
        let (result_tx, result_rx) = oneshot::channel::<IngestStats>();

        let mut tasks = JoinSet::new();

        // Splitter
        {
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let chunk_size = self.config.chunk_size;
            tasks.spawn(async move {
                let mut buf = vec![0u8; chunk_size];
                let mut idx = 0u64;
                loop {
                    let n = tokio::select! {
                        res = reader.read(&mut buf) => res,
                        _ = cancel.cancelled() => return,
                    };
                    match n {
                        Ok(0) => return,
                        Ok(n) => {
                            let item = SplitChunk {
                                idx,
                                bytes: buf[..n].to_vec(),
                            };
                            idx += 1;
                            if chunk_tx.send(item).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = err_tx.try_send(Error::from(anyhow::Error::from(err)));
                            cancel.cancel();
                            return;
                        }
                    }
                }
            });
        }

        // Hasher
        {
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let mut chunk_rx = chunk_rx;
            let hashed_tx = hashed_tx.clone();
            tasks.spawn(async move {
                loop {
                    let item = tokio::select! {
                        item = chunk_rx.recv() => item,
                        _ = cancel.cancelled() => return,
                    };
                    let Some(item) = item else { return };
                    let bytes = item.bytes;
                    let hashed = tokio::task::spawn_blocking(move || {
                        let hash = digest_hex(&bytes);
                        (bytes, hash)
                    })
                    .await;
                    match hashed {
                        Ok((bytes, hash)) => {
                            let out = HashedChunk {
                                idx: item.idx,
                                bytes,
                                hash,
                            };
                            if hashed_tx.send(out).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = err_tx.try_send(Error::Internal(anyhow::anyhow!(
                                "hasher task panicked: {err}"
                            )));
                            cancel.cancel();
                            return;
                        }
                    }
                }
            });
        }

        // Store workers, work-stealing from a single shared receiver.
        let hashed_rx = Arc::new(AsyncMutex::new(hashed_rx));
        for _ in 0..self.config.store_workers.max(1) {
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let hashed_rx = hashed_rx.clone();
            let stored_tx = stored_tx.clone();
            let chunk_store = self.chunk_store.clone();
            let chunk_index = self.chunk_index.clone();
            tasks.spawn(async move {
                loop {
                    let item = {
                        let mut rx = hashed_rx.lock().await;
                        tokio::select! {
                            item = rx.recv() => item,
                            _ = cancel.cancelled() => return,
                        }
                    };
                    let Some(item) = item else { return };
                    let size = item.bytes.len() as u64;

                    let store_result: Result<bool> = async {
                        let reused = chunk_store.exists_async(item.hash.clone()).await?;
                        if !reused {
                            chunk_store
                                .put_async(item.hash.clone(), item.bytes)
                                .await?;
                        }
                        chunk_index.upsert_chunk(&item.hash, size).await?;
                        Ok(reused)
                    }
                    .await;

                    match store_result {
                        Ok(reused) => {
                            let out = StoredChunk {
                                idx: item.idx,
                                hash: item.hash,
                                size,
                                reused,
                            };
                            if stored_tx.send(out).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = err_tx.try_send(err);
                            cancel.cancel();
                            return;
                        }
                    }
                }
            });
        }
        drop(stored_tx);
        drop(hashed_tx);

        // Manifest batcher
        {
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let manifest_sink = self.manifest_sink.clone();
            let batch_size = self.config.batch_size;
            tasks.spawn(async move {
                let mut reorder: HashMap<u64, StoredChunk> = HashMap::new();
                let mut next_idx = 0u64;
                let mut pending: Vec<ManifestEntry> = Vec::with_capacity(batch_size);
                let mut stats = IngestStats::default();

                loop {
                    let item = tokio::select! {
                        item = stored_rx.recv() => item,
                        _ = cancel.cancelled() => None,
                    };
                    let Some(item) = item else { break };
                    reorder.insert(item.idx, item);

                    while let Some(item) = reorder.remove(&next_idx) {
                        stats.total_size += item.size;
                        stats.chunks_count += 1;
                        if item.reused {
                            stats.dedupe_saved_bytes += item.size;
                        } else {
                            stats.unique_chunks_written += 1;
                        }
                        pending.push(ManifestEntry {
                            idx: item.idx,
                            hash: item.hash,
                            size: item.size,
                        });
                        next_idx += 1;

                        if pending.len() >= batch_size {
                            let batch = std::mem::take(&mut pending);
                            if let Err(err) = manifest_sink.add_manifest_batch(file_id, &batch).await {
                                let _ = err_tx.try_send(err);
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                }

                if !pending.is_empty() {
                    if let Err(err) = manifest_sink.add_manifest_batch(file_id, &pending).await {
                        let _ = err_tx.try_send(err);
                        cancel.cancel();
                        return;
                    }
                }

                let _ = result_tx.send(stats);
            });
        }

        while tasks.join_next().await.is_some() {}

        if let Ok(err) = err_rx.try_recv() {
            return Err(err);
        }

        result_rx
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("ingest pipeline produced no result")))
    }
}
