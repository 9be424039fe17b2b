use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

/// Room for multipart boundaries and part headers on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.config.policy.max_file_size())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // Files
        .route(
            "/files/:namespace",
            get(handlers::list_files)
                .post(handlers::upload_file)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/files/:namespace/:name",
            get(handlers::download_file).delete(handlers::delete_file),
        )
        // Internal
        .route("/_internal/health", get(handlers::health))
        .route("/_internal/gc", post(handlers::collect_garbage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
