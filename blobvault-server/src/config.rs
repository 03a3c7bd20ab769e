//! Process configuration, assembled once at startup from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use blobvault_datastore::IngestConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub base_dir: PathBuf,
    pub middleware_key: String,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub store_workers: usize,
    pub max_upload_bytes: u64,
    pub max_multipart_memory_bytes: usize,
    pub stream_buffer_bytes: usize,
    pub listen_addr: SocketAddr,
    pub db_pool_max_connections: u32,
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("required environment variable {name} is not set"))
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid value for {name} ({raw:?}): {err}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow::anyhow!("reading {name} failed: {err}")),
    }
}

impl Config {
    /// Loads configuration from the process environment. Every tunable has
    /// a default except `DATABASE_URL`, `BASE_DIR` and `MIDDLEWARE_KEY`,
    /// which abort startup if unset.
    pub fn from_env() -> Result<Self> {
        let database_url = env_var("DATABASE_URL")?;

        let base_dir = PathBuf::from(env_var("BASE_DIR")?);
        let base_dir = if base_dir.is_absolute() {
            base_dir
        } else {
            std::env::current_dir()
                .context("resolving current directory for relative BASE_DIR")?
                .join(base_dir)
        };

        let middleware_key = env_var("MIDDLEWARE_KEY")?;
        if middleware_key.is_empty() {
            anyhow::bail!("MIDDLEWARE_KEY must not be empty");
        }

        let chunk_size: usize = env_parse("CHUNK_SIZE_BYTES", 4 * 1024 * 1024)?;
        let batch_size: usize = env_parse("MANIFEST_BATCH_SIZE", 200)?;
        let store_workers: usize = env_parse("STORE_WORKERS", 10)?;
        let max_upload_bytes: u64 = env_parse("MAX_UPLOAD_BYTES", 2 * 1024 * 1024 * 1024)?;
        let max_multipart_memory_bytes: usize =
            env_parse("MAX_MULTIPART_MEMORY_BYTES", 32 * 1024 * 1024)?;
        let stream_buffer_bytes: usize = env_parse("STREAM_BUFFER_BYTES", 128 * 1024)?;
        let listen_addr: SocketAddr = env_parse("LISTEN_ADDR", ([0, 0, 0, 0], 8080).into())?;
        let db_pool_max_connections: u32 =
            env_parse("DATABASE_MAX_CONNECTIONS", store_workers as u32 + 4)?;

        Ok(Self {
            database_url,
            base_dir,
            middleware_key,
            chunk_size,
            batch_size,
            store_workers,
            max_upload_bytes,
            max_multipart_memory_bytes,
            stream_buffer_bytes,
            listen_addr,
            db_pool_max_connections,
        })
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            chunk_size: self.chunk_size,
            batch_size: self.batch_size,
            store_workers: self.store_workers,
            ..IngestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // std::env mutation races across threads; run config tests on one thread.
    fn with_required_env<F: FnOnce()>(f: F) {
        std::env::set_var("DATABASE_URL", "postgres://localhost/blobvault_test");
        std::env::set_var("BASE_DIR", "/tmp/blobvault-config-test");
        std::env::set_var("MIDDLEWARE_KEY", "secret");
        f();
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("BASE_DIR");
        std::env::remove_var("MIDDLEWARE_KEY");
    }

    #[test]
    fn defaults_match_spec_constants() {
        with_required_env(|| {
            let config = Config::from_env().unwrap();
            assert_eq!(config.chunk_size, 4 * 1024 * 1024);
            assert_eq!(config.batch_size, 200);
            assert_eq!(config.store_workers, 10);
            assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024 * 1024);
            assert_eq!(config.max_multipart_memory_bytes, 32 * 1024 * 1024);
            assert_eq!(config.stream_buffer_bytes, 128 * 1024);
            assert_eq!(config.db_pool_max_connections, 14);
        });
    }

    #[test]
    fn empty_middleware_key_is_rejected() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/blobvault_test");
        std::env::set_var("BASE_DIR", "/tmp/blobvault-config-test");
        std::env::set_var("MIDDLEWARE_KEY", "");
        assert!(Config::from_env().is_err());
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("BASE_DIR");
        std::env::remove_var("MIDDLEWARE_KEY");
    }

    #[test]
    fn missing_database_url_is_a_fatal_error() {
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("BASE_DIR", "/tmp/blobvault-config-test");
        std::env::set_var("MIDDLEWARE_KEY", "secret");
        assert!(Config::from_env().is_err());
        std::env::remove_var("BASE_DIR");
        std::env::remove_var("MIDDLEWARE_KEY");
    }
}
