//! Per-challenge lab provisioning, activation and autograding

use super::{ok, Envelope};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath};
use crate::state::AppState;
use axum::{extract::State, Json};
use lab_orchestrator::{AutogradeOutcome, ConnectionInfo, ProvisionSpec};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct AutogradeBody {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// PUT /challenges/:id/provision
pub async fn provision(
    State(state): State<Arc<AppState>>,
    ApiPath(challenge_id): ApiPath<u64>,
    ApiJson(spec): ApiJson<ProvisionSpec>,
) -> Result<Json<Envelope<ConnectionInfo>>, ApiError> {
    let info = state.orchestrator.provision(challenge_id, &spec).await?;
    Ok(ok(info))
}

/// POST /challenges/:id/activate
pub async fn activate(
    State(state): State<Arc<AppState>>,
    ApiPath(challenge_id): ApiPath<u64>,
    ApiJson(spec): ApiJson<ProvisionSpec>,
) -> Result<Json<Envelope<ConnectionInfo>>, ApiError> {
    let info = state.orchestrator.activate(challenge_id, &spec).await?;
    Ok(ok(info))
}

/// POST /challenges/:id/autograde
pub async fn autograde(
    State(state): State<Arc<AppState>>,
    ApiPath(challenge_id): ApiPath<u64>,
    ApiJson(body): ApiJson<AutogradeBody>,
) -> Result<Json<Envelope<AutogradeOutcome>>, ApiError> {
    let outcome = state
        .orchestrator
        .autograde(challenge_id, &body.commands)
        .await?;
    Ok(ok(outcome))
}
