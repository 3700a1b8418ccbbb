//! Shared application state for the API server.

use std::sync::Arc;

use codex_orchestrator::orchestrator::Orchestrator;

use crate::guard::OriginPolicy;

/// Shared state accessible from all request handlers.
///
/// The orchestrator owns the in-process job registry, so every handler must
/// see the same instance.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub origins: Arc<OriginPolicy>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, origins: OriginPolicy) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            origins: Arc::new(origins),
        }
    }
}
