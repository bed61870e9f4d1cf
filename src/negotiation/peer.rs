use crate::audio::MediaTrack;
use crate::error::NegotiationError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Session-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Transport state reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Counters of the nominated candidate pair
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub round_trip_time_ms: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServer {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// One WebRTC peer connection, send-only audio
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_audio_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<(), NegotiationError>;

    fn ice_gathering_state(&self) -> watch::Receiver<IceGatheringState>;

    /// Local description including every gathered candidate
    async fn local_description(&self) -> Option<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError>;

    fn transport_state(&self) -> watch::Receiver<TransportState>;

    async fn stats(&self) -> Option<TransportStats>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
