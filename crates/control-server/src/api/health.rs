//! Health endpoint

use super::{ok, Envelope};
use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
}

/// GET /health
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<HealthStatus>>, ApiError> {
    state.orchestrator.ping().await?;
    Ok(ok(HealthStatus { ok: true }))
}
