use crate::audio::CaptureConstraints;
use crate::negotiation::NegotiatorConfig;
use crate::signaling::ChannelConfig;
use std::time::Duration;

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub negotiator: NegotiatorConfig,

    pub channel: ChannelConfig,

    /// Raw-capture constraints for the microphone
    pub capture: CaptureConstraints,

    /// Voice-activity sampling cadence
    /// Default: 100ms
    pub sample_interval: Duration,

    /// Wait before the single signaling reconnect or transport renegotiation
    /// Default: 5 seconds
    pub reconnect_delay: Duration,

    /// A renegotiated transport must stay connected this long before its
    /// retry budget comes back
    /// Default: 30 seconds
    pub transport_stable_period: Duration,

    /// Pause between a completed cycle and listening again
    pub relisten_delay: Duration,
}

impl SessionConfig {
    /// Fresh id for a new `start()`
    pub fn new_session_id() -> String {
        format!("session-{}", uuid::Uuid::new_v4())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiator: NegotiatorConfig::default(),
            channel: ChannelConfig::default(),
            capture: CaptureConstraints::default(),
            sample_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            transport_stable_period: Duration::from_secs(30),
            relisten_delay: Duration::from_secs(1),
        }
    }
}
