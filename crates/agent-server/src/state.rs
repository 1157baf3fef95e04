//! Application State

use std::sync::Arc;

use agent_core::AgentService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Query service over the provider, tool host and conversation store
    pub service: Arc<AgentService>,
}

impl AppState {
    pub fn new(service: AgentService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
