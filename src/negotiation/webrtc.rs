//! Peer connection backed by the `webrtc` crate

use super::encoder::TrackCodec;
use super::peer::{
    IceGatheringState, IceServer, PeerConnection, PeerConnectionFactory, TransportState,
    TransportStats,
};
use crate::audio::MediaTrack;
use crate::error::NegotiationError;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn offer_error(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::OfferCreationFailed(e.to_string())
}

pub struct WebRtcPeerFactory {
    codec: TrackCodec,
}

impl WebRtcPeerFactory {
    pub fn new(codec: TrackCodec) -> Self {
        Self { codec }
    }
}

#[async_trait::async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(offer_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(offer_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(offer_error)?);
        Ok(Arc::new(WebRtcPeer::new(pc, self.codec)))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    codec: TrackCodec,
    gathering_tx: Arc<watch::Sender<IceGatheringState>>,
    transport_tx: Arc<watch::Sender<TransportState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcPeer {
    fn new(pc: Arc<RTCPeerConnection>, codec: TrackCodec) -> Self {
        let (gathering_tx, _) = watch::channel(IceGatheringState::New);
        let (transport_tx, _) = watch::channel(TransportState::New);
        let gathering_tx = Arc::new(gathering_tx);
        let transport_tx = Arc::new(transport_tx);

        // Registered before the local description is set so Complete is never missed
        let tx = gathering_tx.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!(state = ?state, "ICE gathering state changed");
            let mapped = match state {
                RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                RTCIceGathererState::Complete => IceGatheringState::Complete,
                _ => IceGatheringState::New,
            };
            tx.send_replace(mapped);
            Box::pin(async {})
        }));

        let tx = transport_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection state: {}", state);
            let mapped = match state {
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
                _ => TransportState::New,
            };
            tx.send_replace(mapped);
            Box::pin(async {})
        }));

        Self {
            pc,
            codec,
            gathering_tx,
            transport_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn keep(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        } else {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_audio_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
        let mut encoder = self.codec.encoder()?;

        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: self.codec.mime_type().to_string(),
                clock_rate: self.codec.clock_rate(),
                channels: self.codec.channels(),
                sdp_fmtp_line: self.codec.sdp_fmtp_line().to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "loqa-voice".to_string(),
        ));

        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(offer_error)?;

        // RTCP must be drained for interceptors to work
        self.keep(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut buf).await {}
        }));

        let mut frames = track.subscribe();
        self.keep(tokio::spawn(async move {
            loop {
                let frame = match frames.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Media pump lagged by {} frames", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                for packet in encoder.encode(frame) {
                    let sample = Sample {
                        data: packet.data,
                        duration: packet.duration,
                        ..Default::default()
                    };
                    if let Err(e) = local.write_sample(&sample).await {
                        debug!("Failed to write sample: {}", e);
                    }
                }
            }
        }));

        Ok(())
    }

    async fn create_offer(&self) -> Result<(), NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(offer_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(offer_error)?;
        Ok(())
    }

    fn ice_gathering_state(&self) -> watch::Receiver<IceGatheringState> {
        self.gathering_tx.subscribe()
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| NegotiationError::RemoteAnswerInvalid(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::RemoteAnswerInvalid(e.to_string()))
    }

    fn transport_state(&self) -> watch::Receiver<TransportState> {
        self.transport_tx.subscribe()
    }

    async fn stats(&self) -> Option<TransportStats> {
        let report = self.pc.get_stats().await;
        report.reports.values().find_map(|r| match r {
            StatsReportType::CandidatePair(pair) if pair.nominated => Some(TransportStats {
                round_trip_time_ms: Some(pair.current_round_trip_time * 1000.0),
                bytes_sent: pair.bytes_sent,
                bytes_received: pair.bytes_received,
            }),
            _ => None,
        })
    }

    async fn close(&self) {
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}
