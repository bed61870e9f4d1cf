pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod negotiation;
pub mod pipeline;
pub mod session;
pub mod signaling;

pub use audio::{
    AudioCapture, AudioFile, AudioFrame, AudioSample, CaptureConstraints, ConnectionQuality,
    MediaDevices, MediaStream, MediaTrack, WavFileDevices,
};
pub use config::Config;
pub use error::{ErrorInfo, ErrorKind, SessionError};
pub use http::{create_router, AppState};
pub use negotiation::{ConnectionNegotiator, ConnectionState, WebRtcPeerFactory};
pub use pipeline::{PipelineStateMachine, PipelineStep, PipelineTracker};
pub use session::{SessionConfig, SessionSnapshot, TtsChunk, VoiceSession};
pub use signaling::{SignalingChannel, WsConnector};
