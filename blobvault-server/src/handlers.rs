use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use blobvault_datastore::{Error as CoreError, IngestPipeline};
use futures::StreamExt;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("multipart/form-data") {
        return Err(CoreError::UnsupportedMediaType.into());
    }

    let mut override_filename: Option<String> = None;
    let mut file_field = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| CoreError::InvalidInput(format!("malformed multipart body: {err}")))?
    {
        match field.name() {
            Some("filename") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| CoreError::InvalidInput(format!("invalid filename field: {err}")))?;
                if !text.is_empty() {
                    override_filename = Some(text);
                }
            }
            Some("file") => {
                file_field = Some(field);
                break;
            }
            _ => {}
        }
    }

    let field = file_field.ok_or_else(|| CoreError::InvalidInput("missing 'file' field".into()))?;
    let filename = override_filename
        .or_else(|| field.file_name().map(String::from))
        .ok_or_else(|| CoreError::InvalidInput("no filename provided".into()))?;

    let file_record = state.index.create_file(&filename).await?;
    let file_id = file_record.id;

    let max_bytes = state.config.max_upload_bytes;
    let mut seen: u64 = 0;
    let byte_stream = field.map(move |chunk| {
        let bytes = chunk.map_err(|err| std::io::Error::other(err.to_string()))?;
        seen += bytes.len() as u64;
        if seen > max_bytes {
            return Err(std::io::Error::other("upload exceeds configured size limit"));
        }
        Ok(bytes)
    });
    let reader = StreamReader::new(byte_stream);

    let pipeline = IngestPipeline::new(
        state.chunk_store.clone(),
        state.index.clone(),
        state.index.clone(),
        state.config.ingest_config(),
    );

    match pipeline.run(file_id, reader).await {
        Ok(stats) => {
            state.index.update_totals(file_id, stats.total_size).await?;
            log::info!(
                "ingest finished: file={file_id} filename={filename:?} total_size={} chunks={} unique_written={} dedupe_saved={}",
                stats.total_size,
                stats.chunks_count,
                stats.unique_chunks_written,
                stats.dedupe_saved_bytes,
            );
            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "code": 201,
                    "status": "Success!",
                    "data": {
                        "file_id": file_id,
                        "total_size": stats.total_size,
                        "chunks_count": stats.chunks_count,
                        "unique_chunks_written": stats.unique_chunks_written,
                        "dedupe_saved_bytes": stats.dedupe_saved_bytes,
                    }
                })),
            )
                .into_response())
        }
        Err(err) => {
            log::warn!("ingest failed for file {file_id}: {err}");
            state.index.delete_file_best_effort(file_id).await;
            let core_err = if err.to_string().contains("exceeds configured size limit") {
                CoreError::TooLarge
            } else {
                err
            };
            Err(core_err.into())
        }
    }
}

pub async fn list_files(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let files = state.index.list_files().await?;
    Ok(Json(files).into_response())
}

pub async fn file_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let metadata = state.index.find_metadata(id).await?;
    Ok(Json(metadata).into_response())
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let file = state.index.find_file(id).await?;
    let total_size = u64::try_from(file.total_size)
        .map_err(|_| CoreError::Internal(anyhow::anyhow!("negative total_size in database")))?;

    let (writer, reader) = tokio::io::duplex(state.config.stream_buffer_bytes);
    let assembler = state.stream_assembler.clone();
    tokio::spawn(async move {
        if let Err(err) = assembler.stream(id, writer).await {
            log::error!("streaming file {id} failed: {err}");
        }
    });

    let body = Body::from_stream(ReaderStream::new(reader));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, total_size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.filename.replace('"', "")),
        )
        .body(body)
        .map_err(|err| CoreError::Internal(err.into()))?;

    Ok(response)
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let result = state.gc.delete_file(id).await?;
    Ok(Json(json!({
        "file_id": id,
        "orphan_chunks_deleted": result.orphan_chunks_deleted,
        "orphan_bytes_deleted": result.orphan_bytes_deleted,
    }))
    .into_response())
}
