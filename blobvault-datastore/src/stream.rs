//! Reconstructs a file from its manifest by concatenating chunk blobs in order.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::error::{Error, Result};
use crate::ingest::ManifestEntry;

/// What the stream assembler needs from the relational index.
#[async_trait::async_trait]
pub trait FileLookup: Send + Sync {
    /// Errors with `Error::NotFound` if the file does not exist.
    async fn total_size(&self, file_id: Uuid) -> Result<u64>;
    async fn manifest(&self, file_id: Uuid) -> Result<Vec<ManifestEntry>>;
}

pub struct StreamAssembler {
    chunk_store: Arc<ChunkStore>,
    index: Arc<dyn FileLookup>,
}

impl StreamAssembler {
    pub fn new(chunk_store: Arc<ChunkStore>, index: Arc<dyn FileLookup>) -> Self {
        Self { chunk_store, index }
    }

    /// Streams the file's bytes to `writer`, returning the number of bytes
    /// written. The read transaction behind `total_size`/`manifest` must
    /// already be committed by the time this is called; nothing here holds
    /// a database transaction open.
    pub async fn stream<W>(&self, file_id: Uuid, mut writer: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let total_size = self.index.total_size(file_id).await?;
        let manifest = self.index.manifest(file_id).await?;

        if manifest.is_empty() {
            if total_size == 0 {
                return Ok(0);
            }
            return Err(Error::Corrupt(format!(
                "file {file_id} has total_size {total_size} but an empty manifest"
            )));
        }

        let manifest_sum: u64 = manifest.iter().map(|e| e.size).sum();
        if manifest_sum != total_size {
            return Err(Error::Corrupt(format!(
                "file {file_id} manifest sums to {manifest_sum} bytes but total_size is {total_size}"
            )));
        }

        let mut written = 0u64;
        for entry in &manifest {
            let data = self.chunk_store.get_async(entry.hash.clone()).await?;
            if data.len() as u64 != entry.size {
                return Err(Error::Corrupt(format!(
                    "chunk {} for file {file_id} is {} bytes on disk, manifest says {}",
                    entry.hash,
                    data.len(),
                    entry.size
                )));
            }
            writer.write_all(&data).await?;
            written += data.len() as u64;
        }

        if written != total_size {
            return Err(Error::Corrupt(format!(
                "file {file_id} streamed {written} bytes, expected {total_size}"
            )));
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeIndex {
        files: Mutex<HashMap<Uuid, (u64, Vec<ManifestEntry>)>>,
    }

    #[async_trait::async_trait]
    impl FileLookup for FakeIndex {
        async fn total_size(&self, file_id: Uuid) -> Result<u64> {
            self.files
                .lock()
                .unwrap()
                .get(&file_id)
                .map(|(size, _)| *size)
                .ok_or(Error::NotFound)
        }

        async fn manifest(&self, file_id: Uuid) -> Result<Vec<ManifestEntry>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(&file_id)
                .map(|(_, m)| m.clone())
                .unwrap_or_default())
        }
    }

    fn store() -> (tempfile::TempDir, Arc<ChunkStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn streams_concatenated_chunks_in_order() {
        let (_dir, chunk_store) = store();
        let a = b"first-chunk-bytes".to_vec();
        let b = b"second-chunk-bytes".to_vec();
        let ha = crate::hash::digest_hex(&a);
        let hb = crate::hash::digest_hex(&b);
        chunk_store.put(&ha, &a).unwrap();
        chunk_store.put(&hb, &b).unwrap();

        let file_id = Uuid::new_v4();
        let mut files = HashMap::new();
        files.insert(
            file_id,
            (
                (a.len() + b.len()) as u64,
                vec![
                    ManifestEntry { idx: 0, hash: ha, size: a.len() as u64 },
                    ManifestEntry { idx: 1, hash: hb, size: b.len() as u64 },
                ],
            ),
        );
        let index = Arc::new(FakeIndex { files: Mutex::new(files) });
        let assembler = StreamAssembler::new(chunk_store, index);

        let mut out = Vec::new();
        let written = assembler.stream(file_id, &mut out).await.unwrap();
        assert_eq!(written, (a.len() + b.len()) as u64);
        assert_eq!(out, [a, b].concat());
    }

    #[tokio::test]
    async fn empty_manifest_with_zero_size_is_empty_stream() {
        let (_dir, chunk_store) = store();
        let file_id = Uuid::new_v4();
        let mut files = HashMap::new();
        files.insert(file_id, (0u64, Vec::new()));
        let index = Arc::new(FakeIndex { files: Mutex::new(files) });
        let assembler = StreamAssembler::new(chunk_store, index);

        let mut out = Vec::new();
        let written = assembler.stream(file_id, &mut out).await.unwrap();
        assert_eq!(written, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn empty_manifest_with_nonzero_size_is_corrupt() {
        let (_dir, chunk_store) = store();
        let file_id = Uuid::new_v4();
        let mut files = HashMap::new();
        files.insert(file_id, (42u64, Vec::new()));
        let index = Arc::new(FakeIndex { files: Mutex::new(files) });
        let assembler = StreamAssembler::new(chunk_store, index);

        let mut out = Vec::new();
        assert!(matches!(
            assembler.stream(file_id, &mut out).await,
            Err(Error::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, chunk_store) = store();
        let index = Arc::new(FakeIndex { files: Mutex::new(HashMap::new()) });
        let assembler = StreamAssembler::new(chunk_store, index);
        let mut out = Vec::new();
        assert!(matches!(
            assembler.stream(Uuid::new_v4(), &mut out).await,
            Err(Error::NotFound)
        ));
    }
}
