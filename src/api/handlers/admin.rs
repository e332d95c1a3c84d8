use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub blobs_deleted: u64,
    pub blobs_scanned: u64,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn sweep_orphans(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<SweepResponse>>, ApiError> {
    let stats = state.lifecycle.sweep_orphans(state.config.orphan_grace()).await?;

    tracing::warn!(deleted = stats.deleted, "Swept orphaned blobs");

    Ok(JSend::success(SweepResponse {
        blobs_deleted: stats.deleted,
        blobs_scanned: stats.scanned,
    }))
}
