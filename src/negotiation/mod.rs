//! WHIP-based WebRTC negotiation
//!
//! - `peer`: peer connection abstraction and connection states
//! - `negotiator`: offer, full ICE gathering, POST, answer
//! - `whip`: HTTP client for the WHIP endpoint
//! - `webrtc`: production peer on the `webrtc` crate
//! - `encoder`: PCM to PCMU/Opus packets for the outgoing track

pub mod encoder;
pub mod negotiator;
pub mod peer;
pub mod sdp;
pub mod webrtc;
pub mod whip;

pub use encoder::TrackCodec;
pub use negotiator::{ConnectionNegotiator, Negotiated, NegotiatorConfig, TransportQuality};
pub use peer::{
    ConnectionState, IceGatheringState, IceServer, PeerConnection, PeerConnectionFactory,
    TransportState, TransportStats,
};
pub use self::webrtc::WebRtcPeerFactory;
pub use whip::{WhipAnswer, WhipClient};
