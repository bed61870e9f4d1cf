//! Duplex event channel to the backend orchestrator
//!
//! - `messages`: inbound/outbound catalog
//! - `transport`: frame-level connector (WebSocket in production)
//! - `channel`: bootstrap, heartbeat, ordered inbound dispatch
//! - `reconnect`: bounded retry policy consulted by the session

pub mod channel;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use channel::{ChannelConfig, ChannelEvent, SignalingChannel};
pub use messages::{
    parse_text, BackendPipelineState, ControlEvent, InboundEvent, OutboundMessage,
    PipelineStateUpdate, ServiceKind, ServiceStatusUpdate, TranscriptUpdate, WireServiceStatus,
};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use transport::{
    Frame, FrameSink, FrameStream, SignalingConnector, WsConnector, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};
