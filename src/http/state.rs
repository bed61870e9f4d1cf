use crate::session::VoiceSession;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The one session this process drives
    pub session: Arc<VoiceSession>,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(session: Arc<VoiceSession>) -> Self {
        Self {
            session,
            cors_origins: Vec::new(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
