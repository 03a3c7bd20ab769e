//! Relational persistence: files, the deduplicated chunk table, and the
//! per-file manifest. Every write here runs inside a short-lived
//! transaction; nothing holds a transaction open across chunk-store I/O.

use blobvault_datastore::{ChunkIndex, DeletionIndex, Error as CoreError, FileLookup, ManifestEntry, ManifestSink, Result as CoreResult};
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Chunk, FileMetadata, FileRecord};

pub struct FileIndex {
    pool: PgPool,
}

fn to_core(err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::RowNotFound => CoreError::NotFound,
        other => CoreError::Internal(other.into()),
    }
}

fn size_to_i64(size: u64) -> CoreResult<i64> {
    i64::try_from(size).map_err(|_| CoreError::InvalidInput(format!("size {size} out of range")))
}

impl FileIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect_and_migrate(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_file(&self, filename: &str) -> Result<FileRecord, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            "INSERT INTO files (filename, total_size) VALUES ($1, 0) \
             RETURNING id, filename, total_size, created_at, updated_at",
        )
        .bind(filename)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn find_file(&self, id: Uuid) -> CoreResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, filename, total_size, created_at, updated_at FROM files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_core)?
        .ok_or(CoreError::NotFound)
    }

    pub async fn find_metadata(&self, id: Uuid) -> CoreResult<FileMetadata> {
        let file = self.find_file(id).await?;
        let chunks_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_chunks WHERE file_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(to_core)?;

        Ok(FileMetadata {
            id: file.id,
            filename: file.filename,
            total_size: file.total_size,
            chunks_count,
            created_at: file.created_at,
            updated_at: file.updated_at,
        })
    }

    /// Looks up a chunk row by its hash, independent of which files
    /// reference it.
    pub async fn find_chunk(&self, hash: &str) -> CoreResult<Chunk> {
        sqlx::query_as::<_, Chunk>("SELECT hash, size, created_at FROM chunks WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_core)?
            .ok_or(CoreError::NotFound)
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, filename, total_size, created_at, updated_at FROM files ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Updates `total_size` to close out a successful ingest. Cross-checks
    /// the caller's sum against the manifest actually committed, since this
    /// is the last chance to catch a reorder-map or batching bug before the
    /// file becomes externally visible.
    pub async fn update_totals(&self, id: Uuid, total_size: u64) -> CoreResult<()> {
        let total_size = size_to_i64(total_size)?;

        let manifest_sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM file_chunks WHERE file_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(to_core)?;
        if manifest_sum != total_size {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "file {id} manifest sums to {manifest_sum} bytes but ingest reported {total_size}"
            )));
        }

        let result = sqlx::query(
            "UPDATE files SET total_size = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(total_size)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(to_core)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound);
        }
        Ok(())
    }

    /// Deletes the orphaned `File` row left behind by a failed ingest.
    /// Best-effort: callers already have a primary error to report.
    pub async fn delete_file_best_effort(&self, id: Uuid) {
        if let Err(err) = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            log::warn!("failed to clean up orphaned file {id} after ingest failure: {err}");
        }
    }
}

#[async_trait::async_trait]
impl ChunkIndex for FileIndex {
    async fn upsert_chunk(&self, hash: &str, size: u64) -> CoreResult<bool> {
        let size = size_to_i64(size)?;
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(to_core)?;

        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO chunks (hash, size) VALUES ($1, $2) \
             ON CONFLICT (hash) DO NOTHING RETURNING hash",
        )
        .bind(hash)
        .bind(size)
        .fetch_optional(&mut *tx)
        .await
        .map_err(to_core)?;

        let was_new = inserted.is_some();

        tx.commit().await.map_err(to_core)?;
        Ok(was_new)
    }
}

#[async_trait::async_trait]
impl ManifestSink for FileIndex {
    async fn add_manifest_batch(&self, file_id: Uuid, entries: &[ManifestEntry]) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(to_core)?;

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO file_chunks (file_id, idx, chunk_hash, size) ",
        );
        builder.push_values(entries, |mut row, entry| {
            let idx = entry.idx as i64;
            let size = entry.size as i64;
            row.push_bind(file_id)
                .push_bind(idx)
                .push_bind(&entry.hash)
                .push_bind(size);
        });

        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(to_core)?;

        if result.rows_affected() != entries.len() as u64 {
            tx.rollback().await.map_err(to_core)?;
            return Err(CoreError::Internal(anyhow::anyhow!(
                "manifest batch for file {file_id} inserted {} rows, expected {}",
                result.rows_affected(),
                entries.len()
            )));
        }

        tx.commit().await.map_err(to_core)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileLookup for FileIndex {
    async fn total_size(&self, file_id: Uuid) -> CoreResult<u64> {
        let record = self.find_file(file_id).await?;
        u64::try_from(record.total_size)
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("negative total_size in database")))
    }

    async fn manifest(&self, file_id: Uuid) -> CoreResult<Vec<ManifestEntry>> {
        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            "SELECT idx, chunk_hash, size FROM file_chunks WHERE file_id = $1 ORDER BY idx ASC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(to_core)?;

        rows.into_iter()
            .map(|(idx, hash, size)| {
                Ok(ManifestEntry {
                    idx: u64::try_from(idx)
                        .map_err(|_| CoreError::Internal(anyhow::anyhow!("negative idx in database")))?,
                    hash,
                    size: u64::try_from(size)
                        .map_err(|_| CoreError::Internal(anyhow::anyhow!("negative size in database")))?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DeletionIndex for FileIndex {
    async fn delete_file_and_collect_orphans(&self, file_id: Uuid) -> CoreResult<Vec<(String, u64)>> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(to_core)?;

        let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_core)?;
        if existing.is_none() {
            tx.rollback().await.map_err(to_core)?;
            return Err(CoreError::NotFound);
        }

        let referenced: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT chunk_hash FROM file_chunks WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(to_core)?;

        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(to_core)?;

        let mut orphans = Vec::new();
        for (hash,) in referenced {
            let deleted: Option<(String, i64)> = sqlx::query_as(
                "DELETE FROM chunks c WHERE c.hash = $1 \
                 AND NOT EXISTS (SELECT 1 FROM file_chunks fc WHERE fc.chunk_hash = $1) \
                 RETURNING c.hash, c.size",
            )
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_core)?;

            if let Some((hash, size)) = deleted {
                let size = u64::try_from(size).unwrap_or(0);
                orphans.push((hash, size));
            }
        }

        tx.commit().await.map_err(to_core)?;
        Ok(orphans)
    }
}
