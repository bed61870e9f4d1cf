use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::CaptureConstraints;
use crate::negotiation::{IceServer, NegotiatorConfig, TrackCodec};
use crate::session::SessionConfig;
use crate::signaling::ChannelConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub endpoints: EndpointsConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub audio: AudioConfig,
    pub negotiation: NegotiationConfig,
    pub signaling: SignalingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-voice".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
    /// Browser origins allowed to call the API; empty allows any
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8090,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Media server WHIP endpoint
    pub whip_url: String,
    /// Orchestrator WebSocket endpoint
    pub signaling_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            whip_url: "http://localhost:8001/whip".to_string(),
            signaling_url: "ws://localhost:8004/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Voice-activity sampling cadence
    pub sample_interval_ms: u64,
    pub codec: TrackCodec,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            sample_interval_ms: 100,
            codec: TrackCodec::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub ice_gathering_timeout_secs: u64,
    pub quality_interval_secs: u64,
    pub whip_timeout_secs: u64,
    /// Wait for the transport to report connected after the answer is applied
    pub connect_timeout_secs: u64,
    /// How long a renegotiated transport must hold before another
    /// renegotiation is allowed
    pub transport_stable_secs: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout_secs: 10,
            quality_interval_secs: 2,
            whip_timeout_secs: 15,
            connect_timeout_secs: 15,
            transport_stable_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pause between a completed cycle and the next listening phase
    pub relisten_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relisten_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Load from `<path>.toml` (any format the `config` crate recognises),
    /// with `LOQA_VOICE__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("LOQA_VOICE").separator("__"))
            .build()
            .with_context(|| format!("Failed to read config from {}", path))?;

        settings
            .try_deserialize()
            .context("Failed to deserialize config")
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints::raw(self.audio.sample_rate, self.audio.channels)
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        if self.ice_servers.is_empty() {
            return vec![IceServer::default()];
        }

        self.ice_servers
            .iter()
            .map(|s| IceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
            })
            .collect()
    }

    pub fn negotiator_config(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            whip_url: self.endpoints.whip_url.clone(),
            ice_servers: self.ice_servers(),
            ice_gathering_timeout: Duration::from_secs(self.negotiation.ice_gathering_timeout_secs),
            quality_interval: Duration::from_secs(self.negotiation.quality_interval_secs),
            whip_timeout: Duration::from_secs(self.negotiation.whip_timeout_secs),
            connect_timeout: Duration::from_secs(self.negotiation.connect_timeout_secs),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.endpoints.signaling_url.clone(),
            heartbeat_interval: Duration::from_secs(self.signaling.heartbeat_interval_secs),
            connect_timeout: Duration::from_secs(self.signaling.connect_timeout_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            negotiator: self.negotiator_config(),
            channel: self.channel_config(),
            capture: self.capture_constraints(),
            sample_interval: Duration::from_millis(self.audio.sample_interval_ms),
            reconnect_delay: Duration::from_secs(self.signaling.reconnect_delay_secs),
            transport_stable_period: Duration::from_secs(
                self.negotiation.transport_stable_secs,
            ),
            relisten_delay: Duration::from_millis(self.pipeline.relisten_delay_ms),
        }
    }
}
