//! API routes

pub mod challenges;
pub mod containers;
pub mod health;
pub mod labs;

use crate::auth::require_token;
use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

/// Builds the control surface router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/containers", get(containers::list_containers))
        .route("/containers/:id/logs", get(containers::container_logs))
        .route("/containers/:id/action", post(containers::container_action))
        .route("/challenges/:id/provision", put(challenges::provision))
        .route("/challenges/:id/activate", post(challenges::activate))
        .route("/challenges/:id/autograde", post(challenges::autograde))
        .route("/labs/spawn", post(labs::spawn))
        .route("/labs/:id", delete(labs::stop))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}
