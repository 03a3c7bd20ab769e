mod auth;
mod config;
mod error;
mod handlers;
mod index;
mod models;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use blobvault_datastore::{ChunkStore, DeletionIndex, FileLookup, GarbageCollector, StreamAssembler};

use config::Config;
use index::FileIndex;

pub struct AppState {
    config: Config,
    chunk_store: Arc<ChunkStore>,
    index: Arc<FileIndex>,
    stream_assembler: Arc<StreamAssembler>,
    gc: Arc<GarbageCollector>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    log::info!(
        "starting blobvaultd: base_dir={:?} listen_addr={} store_workers={}",
        config.base_dir,
        config.listen_addr,
        config.store_workers
    );

    let chunk_store = Arc::new(ChunkStore::open(config.base_dir.clone())?);
    let index = Arc::new(
        FileIndex::connect_and_migrate(&config.database_url, config.db_pool_max_connections)
            .await?,
    );

    let stream_assembler = Arc::new(StreamAssembler::new(
        chunk_store.clone(),
        index.clone() as Arc<dyn FileLookup>,
    ));
    let gc = Arc::new(GarbageCollector::new(
        chunk_store.clone(),
        index.clone() as Arc<dyn DeletionIndex>,
    ));

    let listen_addr = config.listen_addr;
    let state = Arc::new(AppState {
        config,
        chunk_store,
        index,
        stream_assembler,
        gc,
    });

    let protected = Router::new()
        .route("/files/upload", post(handlers::upload))
        .route("/files", get(handlers::list_files))
        .route("/files/metadata/:id", get(handlers::file_metadata))
        .route("/files/download/:id", get(handlers::download))
        .route("/files/del/:id", delete(handlers::delete_file))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
