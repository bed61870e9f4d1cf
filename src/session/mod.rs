//! Voice session management
//!
//! This module provides the `VoiceSession` coordinator that manages:
//! - Microphone capture and the voice-activity level
//! - WHIP negotiation of the outgoing audio transport
//! - The signaling channel and its single reconnect
//! - Pipeline tracking, transcripts and conversation history
//! - Ordered teardown on stop, emergency stop and failure

mod config;
mod session;
mod snapshot;

pub use config::SessionConfig;
pub use session::{TtsChunk, VoiceSession};
pub use snapshot::{ConversationHistory, ConversationTurn, SessionSnapshot, Speaker, HISTORY_LIMIT};
