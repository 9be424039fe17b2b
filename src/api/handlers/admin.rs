use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::store::GcStats;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
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

/// Remove unreferenced blobs and stale temp files.
pub async fn collect_garbage(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<GcStats>>, ApiError> {
    let stats = state.manager.collect_garbage().await?;
    Ok(JSend::success(stats))
}
