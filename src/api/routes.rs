use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Files
        .route("/api/files", get(handlers::list_files))
        .route("/api/files/:id", get(handlers::serve_file))
        // Entities
        .route("/api/entities/:kind", post(handlers::create_entity))
        .route("/api/entities/:kind/:id", get(handlers::get_entity))
        .route("/api/entities/:kind/:id", delete(handlers::delete_entity))
        // Single-slot images
        .route(
            "/api/entities/:kind/:id/images/:slot",
            put(handlers::replace_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/entities/:kind/:id/images/:slot",
            delete(handlers::clear_image),
        )
        // Attachments
        .route(
            "/api/entities/:kind/:id/attachments",
            get(handlers::list_attachments),
        )
        .route(
            "/api/entities/:kind/:id/attachments",
            post(handlers::add_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/entities/:kind/:id/attachments/:attachment_id",
            delete(handlers::remove_attachment),
        )
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled, orphan sweep route is available.");
        router = router.route("/admin/sweep", post(handlers::sweep_orphans));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
