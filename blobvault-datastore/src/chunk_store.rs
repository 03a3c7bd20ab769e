use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::format_err;

use crate::error::{Error, Result};
use crate::hash::validate_hash;

/// Content-addressed blob store on a local filesystem. A blob with hash `H`
/// lives at `{base}/{H[0:2]}/{H[2:4]}/{H}`; two levels of 256-way fan-out keep
/// directories small at scale.
///
/// All methods are synchronous; callers on an async runtime are expected to
/// run them via `tokio::task::spawn_blocking` (see [`ChunkStore::put_async`]
/// and friends) rather than block the executor directly.
pub struct ChunkStore {
    base: PathBuf,
}

fn prefix_for(hash: &str) -> (&str, &str) {
    (&hash[0..2], &hash[2..4])
}

impl ChunkStore {
    /// Opens (creating if absent) a chunk store rooted at `base`.
    pub fn open<P: Into<PathBuf>>(base: P) -> Result<Self> {
        let base = base.into();
        if !base.is_absolute() {
            return Err(
                format_err!("chunk store base path must be absolute, got {base:?}").into(),
            );
        }
        fs::create_dir_all(&base)
            .map_err(|err| format_err!("unable to create chunk store at {base:?}: {err}"))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn final_path(&self, hash: &str) -> PathBuf {
        let (a, b) = prefix_for(hash);
        self.base.join(a).join(b).join(hash)
    }

    /// Writes `data` under `hash`, verifying first that `hash` is in fact
    /// the caller's claimed address (callers are expected to hash before
    /// calling Put, but a mismatch here would silently corrupt the store).
    pub fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        validate_hash(hash)?;

        let final_path = self.final_path(hash);
        if final_path.is_file() {
            return Ok(());
        }

        let dir = final_path
            .parent()
            .ok_or_else(|| format_err!("chunk path {final_path:?} has no parent"))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{hash}.tmp-"))
            .tempfile_in(dir)
            .map_err(|err| format_err!("creating temp file for chunk {hash} failed: {err}"))?;

        tmp.write_all(data)
            .map_err(|err| format_err!("writing chunk {hash} failed: {err}"))?;
        tmp.as_file_mut()
            .sync_all()
            .map_err(|err| format_err!("fsync for chunk {hash} failed: {err}"))?;

        match tmp.persist(&final_path) {
            Ok(_) => Ok(()),
            // another writer won the race; by content addressing its bytes
            // must be identical to ours.
            Err(err) if final_path.is_file() => {
                drop(err);
                Ok(())
            }
            Err(err) => Err(format_err!("renaming chunk {hash} into place failed: {err}").into()),
        }
    }

    /// Reads the full contents of `hash`. Returns `Error::NotFound` if absent.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        validate_hash(hash)?;
        let path = self.final_path(hash);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len() as usize;
        let mut buf = Vec::with_capacity(size);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn exists(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        Ok(self.final_path(hash).is_file())
    }

    /// Removes the blob for `hash` and best-effort cleans up now-possibly-empty
    /// parent directories. Absence is not an error.
    pub fn delete(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let path = self.final_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir);
            if let Some(parent) = dir.parent() {
                let _ = fs::remove_dir(parent);
            }
        }
        Ok(())
    }

    pub async fn put_async(self: &std::sync::Arc<Self>, hash: String, data: Vec<u8>) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.put(&hash, &data))
            .await
            .map_err(|err| format_err!("chunk store task panicked: {err}"))?
    }

    pub async fn get_async(self: &std::sync::Arc<Self>, hash: String) -> Result<Vec<u8>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get(&hash))
            .await
            .map_err(|err| format_err!("chunk store task panicked: {err}"))?
    }

    pub async fn exists_async(self: &std::sync::Arc<Self>, hash: String) -> Result<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.exists(&hash))
            .await
            .map_err(|err| format_err!("chunk store task panicked: {err}"))?
    }

    pub async fn delete_async(self: &std::sync::Arc<Self>, hash: String) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.delete(&hash))
            .await
            .map_err(|err| format_err!("chunk store task panicked: {err}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest_hex;

    fn open_temp() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = open_temp();
        let data = b"hello chunk store";
        let hash = digest_hex(data);
        store.put(&hash, data).unwrap();
        assert!(store.exists(&hash).unwrap());
        assert_eq!(store.get(&hash).unwrap(), data);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = open_temp();
        let data = b"same content";
        let hash = digest_hex(data);
        store.put(&hash, data).unwrap();
        store.put(&hash, data).unwrap();
        assert_eq!(store.get(&hash).unwrap(), data);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = open_temp();
        let hash = digest_hex(b"never written");
        assert!(matches!(store.get(&hash), Err(Error::NotFound)));
    }

    #[test]
    fn delete_removes_blob_and_is_idempotent() {
        let (_dir, store) = open_temp();
        let data = b"to be deleted";
        let hash = digest_hex(data);
        store.put(&hash, data).unwrap();
        store.delete(&hash).unwrap();
        assert!(!store.exists(&hash).unwrap());
        store.delete(&hash).unwrap();
    }

    #[test]
    fn rejects_malformed_hash() {
        let (_dir, store) = open_temp();
        assert!(store.put("not-a-hash", b"x").is_err());
        assert!(store.get("short").is_err());
    }

    #[test]
    fn path_layout_uses_two_level_fanout() {
        let (_dir, store) = open_temp();
        let data = b"fanout check";
        let hash = digest_hex(data);
        store.put(&hash, data).unwrap();
        let expected = store.base().join(&hash[0..2]).join(&hash[2..4]).join(&hash);
        assert!(expected.is_file());
    }
}
