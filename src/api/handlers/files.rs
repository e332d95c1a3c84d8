use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::response::{ApiError, AppQuery, JSendPaginated, Pagination};
use crate::blob_store::{BlobMetadata, BlobStoreError, ListOptions};
use crate::storage::models::FILE_ROUTE_PREFIX;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub created_at: String,
    pub id: String,
    pub mime_type: String,
    pub name: String,
    pub size: u64,
    pub updated_at: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub mime_type: Option<String>,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

/// Stream a blob's content.
/// Route: GET /api/files/:id
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (stream, metadata) = tokio::join!(
        state.blob_store.get_stream(&id),
        state.blob_store.get_metadata(&id)
    );

    let reader = match stream {
        Ok(Some(reader)) => reader,
        Ok(None) | Err(BlobStoreError::InvalidId(_)) => {
            return Ok((StatusCode::NOT_FOUND, "File not found").into_response());
        }
        Err(e) => return Err(e.into()),
    };

    // Content without readable metadata is still served, just untyped.
    let mime_type = match metadata {
        Ok(Some(meta)) => Some(meta.mime_type),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(file_id = %id, error = %e, "Failed to read blob metadata");
            None
        }
    };
    let content_type = mime_type
        .and_then(|m| HeaderValue::from_str(&m).ok())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));

    let mut response = Body::from_stream(ReaderStream::new(reader)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);

    Ok(response)
}

/// Route: GET /api/files
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let listing = state
        .blob_store
        .list(ListOptions {
            limit: Some(params.limit as usize),
            offset: Some(params.offset as usize),
            mime_type: params.mime_type.clone(),
        })
        .await?;

    let items = listing.files.iter().map(file_to_response).collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total: listing.total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &BlobMetadata) -> FileResponse {
    FileResponse {
        created_at: file.created_at.to_rfc3339(),
        id: file.id.clone(),
        mime_type: file.mime_type.clone(),
        name: file.name.clone(),
        size: file.size,
        updated_at: file.updated_at.to_rfc3339(),
        url: format!("{FILE_ROUTE_PREFIX}/{}", file.id),
    }
}
