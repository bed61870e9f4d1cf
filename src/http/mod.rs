//! Local HTTP control API
//!
//! This module exposes the voice session over REST:
//! - GET /session - Current snapshot
//! - POST /session/start, /session/stop, /session/emergency-stop
//! - POST /session/listen/start, /session/listen/stop
//! - POST /session/trigger - Send the transcript to the LLM
//! - POST /session/reset, /session/error/clear
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
