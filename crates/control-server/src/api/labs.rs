//! Ad hoc lab sessions

use super::{ok, Envelope};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath};
use crate::state::AppState;
use axum::{extract::State, Json};
use lab_orchestrator::{SpawnRequest, SpawnedLab};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: String,
    pub container_id: String,
}

/// POST /labs/spawn
pub async fn spawn(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<SpawnRequest>,
) -> Result<Json<Envelope<SpawnedLab>>, ApiError> {
    let spawned = state.sessions.spawn(&request).await?;
    Ok(ok(spawned))
}

/// DELETE /labs/:id
pub async fn stop(
    State(state): State<Arc<AppState>>,
    ApiPath(container_id): ApiPath<String>,
) -> Result<Json<Envelope<StopResponse>>, ApiError> {
    state.sessions.stop(&container_id).await?;
    Ok(ok(StopResponse {
        status: "terminated".to_string(),
        container_id,
    }))
}
