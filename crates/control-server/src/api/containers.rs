//! Container listing, logs and lifecycle actions

use super::{ok, Envelope};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::state::AppState;
use axum::{extract::State, Json};
use lab_orchestrator::{ContainerAction, LabError, ListFilter, ManagedContainer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_LOG_TAIL: usize = 300;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub running: Option<bool>,
    pub managed: Option<bool>,
    pub logons: Option<bool>,
}

impl From<ListQuery> for ListFilter {
    fn from(query: ListQuery) -> Self {
        let defaults = ListFilter::default();
        ListFilter {
            running: query.running.unwrap_or(defaults.running),
            managed: query.managed.unwrap_or(defaults.managed),
            logons: query.logons.unwrap_or(defaults.logons),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionBody {
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub message: String,
}

/// GET /containers
pub async fn list_containers(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<Json<Envelope<Vec<ManagedContainer>>>, ApiError> {
    let rows = state.orchestrator.list_containers(query.into()).await?;
    Ok(ok(rows))
}

/// GET /containers/:id/logs
pub async fn container_logs(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<LogsQuery>,
) -> Result<Json<Envelope<LogsResponse>>, ApiError> {
    let tail = match query.tail.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_LOG_TAIL,
        Some(raw) => raw
            .parse()
            .map_err(|_| LabError::Validation(format!("Invalid tail: {raw}")))?,
    };
    let logs = state.orchestrator.logs(&id, tail).await?;
    Ok(ok(LogsResponse { logs }))
}

/// POST /containers/:id/action
pub async fn container_action(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<ActionBody>,
) -> Result<Json<Envelope<ActionResponse>>, ApiError> {
    let action: ContainerAction = body.action.parse()?;
    let message = state.orchestrator.action(&id, action).await?;
    Ok(ok(ActionResponse { message }))
}
