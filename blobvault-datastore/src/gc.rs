//! Reference-counted garbage collection triggered by file deletion.

use std::sync::Arc;

use log::warn;
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct GcResult {
    pub orphan_chunks_deleted: u64,
    pub orphan_bytes_deleted: u64,
}

/// What the garbage collector needs from the relational index. A single
/// call covers the whole transactional step: delete the file and its
/// manifest, then delete any chunk rows that are no longer referenced,
/// returning the set of hashes (and their sizes) that became orphaned.
/// Implementations run this as one committed transaction.
#[async_trait::async_trait]
pub trait DeletionIndex: Send + Sync {
    /// Errors with `Error::NotFound` if the file does not exist.
    async fn delete_file_and_collect_orphans(&self, file_id: Uuid) -> Result<Vec<(String, u64)>>;
}

pub struct GarbageCollector {
    chunk_store: Arc<ChunkStore>,
    index: Arc<dyn DeletionIndex>,
}

impl GarbageCollector {
    pub fn new(chunk_store: Arc<ChunkStore>, index: Arc<dyn DeletionIndex>) -> Self {
        Self { chunk_store, index }
    }

    /// Deletes a file and best-effort removes any chunks left unreferenced
    /// by the deletion. Blob removal failures are logged, not propagated:
    /// an unreferenced blob is harmless and can be swept later.
    pub async fn delete_file(&self, file_id: Uuid) -> Result<GcResult> {
        let orphans = self.index.delete_file_and_collect_orphans(file_id).await?;

        let mut result = GcResult::default();
        for (hash, size) in orphans {
            match self.chunk_store.delete_async(hash.clone()).await {
                Ok(()) => {
                    result.orphan_chunks_deleted += 1;
                    result.orphan_bytes_deleted += size;
                }
                Err(err) => {
                    warn!("failed to delete orphan blob {hash} for file {file_id}: {err}");
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeIndex {
        orphans_by_file: Mutex<HashMap<Uuid, Vec<(String, u64)>>>,
    }

    #[async_trait::async_trait]
    impl DeletionIndex for FakeIndex {
        async fn delete_file_and_collect_orphans(
            &self,
            file_id: Uuid,
        ) -> Result<Vec<(String, u64)>> {
            self.orphans_by_file
                .lock()
                .unwrap()
                .remove(&file_id)
                .ok_or(Error::NotFound)
        }
    }

    fn store() -> (tempfile::TempDir, Arc<ChunkStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn deletes_orphan_blobs_and_counts_them() {
        let (_dir, chunk_store) = store();
        let data = b"shared no more";
        let hash = crate::hash::digest_hex(data);
        chunk_store.put(&hash, data).unwrap();

        let file_id = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert(file_id, vec![(hash.clone(), data.len() as u64)]);
        let index = Arc::new(FakeIndex { orphans_by_file: Mutex::new(map) });
        let gc = GarbageCollector::new(chunk_store.clone(), index);

        let result = gc.delete_file(file_id).await.unwrap();
        assert_eq!(result.orphan_chunks_deleted, 1);
        assert_eq!(result.orphan_bytes_deleted, data.len() as u64);
        assert!(!chunk_store.exists(&hash).unwrap());
    }

    #[tokio::test]
    async fn shared_chunk_not_reported_as_orphan_when_index_says_so() {
        let (_dir, chunk_store) = store();
        let file_id = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert(file_id, Vec::new());
        let index = Arc::new(FakeIndex { orphans_by_file: Mutex::new(map) });
        let gc = GarbageCollector::new(chunk_store, index);

        let result = gc.delete_file(file_id).await.unwrap();
        assert_eq!(result.orphan_chunks_deleted, 0);
        assert_eq!(result.orphan_bytes_deleted, 0);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, chunk_store) = store();
        let index = Arc::new(FakeIndex { orphans_by_file: Mutex::new(HashMap::new()) });
        let gc = GarbageCollector::new(chunk_store, index);
        assert!(matches!(
            gc.delete_file(Uuid::new_v4()).await,
            Err(Error::NotFound)
        ));
    }
}
