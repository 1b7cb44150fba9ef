//! HTTP control surface for the lab orchestrator
//!
//! Every route sits behind the bearer-token middleware and answers with the
//! `{success, data}` / `{success, error}` envelope.

pub mod api;
pub mod auth;
pub mod error;
pub mod extract;
pub mod state;

pub use api::router;
pub use error::ApiError;
pub use state::AppState;
