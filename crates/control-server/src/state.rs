//! Application state

use lab_orchestrator::{LabOrchestrator, SessionManager};
use std::sync::Arc;

pub struct AppState {
    pub orchestrator: Arc<LabOrchestrator>,
    pub sessions: SessionManager,
    /// Shared secret for bearer auth. `None` disables auth.
    pub token: Option<String>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<LabOrchestrator>,
        sessions: SessionManager,
        token: Option<String>,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.token.is_some()
    }
}
