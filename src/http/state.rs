use crate::app::VoiceTwin;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<VoiceTwin>,
}

impl AppState {
    pub fn new(core: Arc<VoiceTwin>) -> Self {
        Self { core }
    }
}
