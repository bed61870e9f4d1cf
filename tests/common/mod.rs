// Shared fakes for the integration tests: scripted microphones, in-memory
// peers, an in-memory signaling link and a mock WHIP endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use loqa_voice::audio::{
    AudioFrame, BroadcastTrack, CaptureConstraints, MediaDevices, MediaStream, MediaTrack,
};
use loqa_voice::error::{CaptureError, NegotiationError, SignalingError};
use loqa_voice::negotiation::{
    IceGatheringState, IceServer, NegotiatorConfig, PeerConnection, PeerConnectionFactory,
    TransportState, TransportStats,
};
use loqa_voice::signaling::{Frame, FrameSink, FrameStream, SignalingConnector};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

pub const ANSWER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:0 PCMU/8000\r\n";

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\na=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n";

// ============================================================================
// Microphone
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Grant {
    Allow,
    Deny,
    /// Allow after a delay, like a permission prompt
    After(Duration),
}

pub struct FakeDevices {
    grant: Grant,
    pub requests: AtomicUsize,
    tracks: Mutex<Vec<Arc<BroadcastTrack>>>,
}

impl FakeDevices {
    pub fn new(grant: Grant) -> Arc<Self> {
        Arc::new(Self {
            grant,
            requests: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn tracks_handed_out(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.is_live())
            .count()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        assert!(!constraints.echo_cancellation);
        assert!(!constraints.noise_suppression);
        assert!(!constraints.auto_gain_control);

        match self.grant {
            Grant::Deny => {
                return Err(CaptureError::PermissionDenied(
                    "NotAllowedError".to_string(),
                ))
            }
            Grant::After(delay) => tokio::time::sleep(delay).await,
            Grant::Allow => {}
        }

        let (track, _tx) = BroadcastTrack::new(format!(
            "fake-mic-{}",
            self.requests.load(Ordering::SeqCst)
        ));
        self.tracks.lock().unwrap().push(track.clone());
        Ok(MediaStream::new(vec![track as Arc<dyn MediaTrack>]))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// A loud 48 kHz mono frame
pub fn tone_frame(timestamp_ms: u64) -> AudioFrame {
    let samples = (0..4800)
        .map(|i| ((i as f32 * 0.3).sin() * 12000.0) as i16)
        .collect();
    AudioFrame {
        samples,
        sample_rate: 48000,
        channels: 1,
        timestamp_ms,
    }
}

// ============================================================================
// Peer connection
// ============================================================================

pub struct FakePeer {
    gathering: watch::Sender<IceGatheringState>,
    transport: watch::Sender<TransportState>,
    pub remote: Mutex<Option<String>>,
    pub closed: AtomicBool,
    pub tracks: AtomicUsize,
    /// Leave ICE gathering running forever
    stall_gathering: bool,
}

impl FakePeer {
    pub fn fail_transport(&self) {
        self.transport.send_replace(TransportState::Failed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_audio_track(&self, _track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<(), NegotiationError> {
        self.gathering.send_replace(IceGatheringState::Gathering);
        if !self.stall_gathering {
            self.gathering.send_replace(IceGatheringState::Complete);
        }
        Ok(())
    }

    fn ice_gathering_state(&self) -> watch::Receiver<IceGatheringState> {
        self.gathering.subscribe()
    }

    async fn local_description(&self) -> Option<String> {
        Some(OFFER_SDP.to_string())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        *self.remote.lock().unwrap() = Some(sdp.to_string());
        self.transport.send_replace(TransportState::Connecting);
        self.transport.send_replace(TransportState::Connected);
        Ok(())
    }

    fn transport_state(&self) -> watch::Receiver<TransportState> {
        self.transport.subscribe()
    }

    async fn stats(&self) -> Option<TransportStats> {
        Some(TransportStats {
            round_trip_time_ms: Some(30.0),
            bytes_sent: 1024,
            bytes_received: 512,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.transport.send_replace(TransportState::Closed);
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub stall_gathering: bool,
    /// Refuse to create more than this many peers
    pub limit: Option<usize>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            stall_gathering: true,
            ..Default::default()
        })
    }

    pub fn limited(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.limit.is_some_and(|limit| self.created() >= limit) {
            return Err(NegotiationError::OfferCreationFailed(
                "peer connection unavailable".to_string(),
            ));
        }
        let (gathering, _) = watch::channel(IceGatheringState::New);
        let (transport, _) = watch::channel(TransportState::New);
        let peer = Arc::new(FakePeer {
            gathering,
            transport,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            tracks: AtomicUsize::new(0),
            stall_gathering: self.stall_gathering,
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Server side of one in-memory signaling connection
pub struct ServerEnd {
    /// Frames the client sent
    pub from_client: fmpsc::UnboundedReceiver<Frame>,
    to_client: fmpsc::UnboundedSender<Result<Frame, SignalingError>>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(text.to_string())));
    }

    pub fn send_binary(&self, data: &[u8]) {
        let _ = self
            .to_client
            .unbounded_send(Ok(Frame::Binary(bytes::Bytes::copy_from_slice(data))));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Close {
            code,
            reason: "test".to_string(),
        }));
    }

    /// Next text frame from the client, parsed
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        while let Some(frame) = self.from_client.next().await {
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Next frame of any kind
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }
}

/// Connector handing each accepted connection's server end to the test
pub struct MemoryConnector {
    pub attempts: AtomicUsize,
    /// Attempt numbers (1-based) to refuse
    refuse: Mutex<Vec<usize>>,
    servers_tx: mpsc::UnboundedSender<ServerEnd>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refuse: Mutex::new(Vec::new()),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        })
    }

    pub fn refuse_attempt(&self, attempt: usize) {
        self.refuse.lock().unwrap().push(attempt);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_server(&self) -> ServerEnd {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream), SignalingError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refuse.lock().unwrap().contains(&attempt) {
            return Err(SignalingError::OpenFailed("connection refused".to_string()));
        }

        let (client_tx, from_client) = fmpsc::unbounded();
        let (to_client, client_rx) = fmpsc::unbounded();
        let _ = self.servers_tx.send(ServerEnd {
            from_client,
            to_client,
        });

        let sink = client_tx.sink_map_err(|_| SignalingError::NotOpen);
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}

// ============================================================================
// WHIP endpoint
// ============================================================================

#[derive(Debug, Clone)]
pub enum WhipReply {
    Answer,
    /// Answer plus a server-assigned session id
    AnswerWithSession(String),
    Empty,
    Reject(u16, String),
}

#[derive(Clone)]
struct WhipState {
    reply: WhipReply,
    seen: Arc<Mutex<Vec<(String, Option<String>, String)>>>,
}

/// Requests the mock received: (content type, X-Session-ID, body)
pub type SeenOffers = Arc<Mutex<Vec<(String, Option<String>, String)>>>;

async fn whip_handler(
    State(state): State<WhipState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.seen.lock().unwrap().push((
        header("content-type").unwrap_or_default(),
        header("x-session-id"),
        body,
    ));

    let mut response_headers = HeaderMap::new();
    response_headers.insert("content-type", "application/sdp".parse().unwrap());
    response_headers.insert("location", "/whip/resource/1".parse().unwrap());

    match state.reply {
        WhipReply::Answer => (StatusCode::CREATED, response_headers, ANSWER_SDP.to_string()),
        WhipReply::AnswerWithSession(id) => {
            response_headers.insert("x-session-id", id.parse().unwrap());
            (StatusCode::CREATED, response_headers, ANSWER_SDP.to_string())
        }
        WhipReply::Empty => (StatusCode::CREATED, response_headers, String::new()),
        WhipReply::Reject(status, body) => (
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            body,
        ),
    }
}

/// Serve a WHIP endpoint on an ephemeral port; returns its URL
pub async fn spawn_whip(reply: WhipReply) -> (String, SeenOffers) {
    let seen: SeenOffers = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/whip", post(whip_handler))
        .with_state(WhipState {
            reply,
            seen: seen.clone(),
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/whip", addr), seen)
}

pub fn negotiator_config(whip_url: &str) -> NegotiatorConfig {
    NegotiatorConfig {
        whip_url: whip_url.to_string(),
        ice_servers: vec![IceServer::default()],
        ice_gathering_timeout: Duration::from_millis(500),
        quality_interval: Duration::from_millis(50),
        whip_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
    }
}
