use super::peer::{
    ConnectionState, IceGatheringState, IceServer, PeerConnection, PeerConnectionFactory,
    TransportState, TransportStats,
};
use super::sdp;
use super::whip::WhipClient;
use crate::audio::{AudioCapture, ConnectionQuality};
use crate::error::NegotiationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub whip_url: String,
    pub ice_servers: Vec<IceServer>,
    pub ice_gathering_timeout: Duration,
    pub quality_interval: Duration,
    pub whip_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            whip_url: "http://localhost:8001/whip".to_string(),
            ice_servers: vec![IceServer::default()],
            ice_gathering_timeout: Duration::from_secs(10),
            quality_interval: Duration::from_secs(2),
            whip_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Quality sample from native transport counters
#[derive(Debug, Clone, Serialize)]
pub struct TransportQuality {
    pub quality: ConnectionQuality,
    pub stats: TransportStats,
    pub sampled_at: DateTime<Utc>,
}

/// Outcome of a successful `connect`
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Backend-assigned id when the WHIP response carried one, else the requested id
    pub session_id: String,
    pub whip_resource: Option<String>,
}

#[derive(Default)]
struct Active {
    peer: Option<Arc<dyn PeerConnection>>,
    tasks: Vec<JoinHandle<()>>,
}

/// WHIP offer/answer exchange and the resulting peer connection.
///
/// Sole writer of `ConnectionState`. Within one `connect` the state only
/// moves `Connecting -> Connected | Failed`; `close()` returns it to
/// `Disconnected`.
pub struct ConnectionNegotiator {
    config: NegotiatorConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    whip: WhipClient,
    state_tx: watch::Sender<ConnectionState>,
    quality_tx: watch::Sender<Option<TransportQuality>>,
    active: Mutex<Active>,
    generation: AtomicU64,
}

impl ConnectionNegotiator {
    pub fn new(
        config: NegotiatorConfig,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self, NegotiationError> {
        let whip = WhipClient::new(config.whip_url.clone(), config.whip_timeout)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (quality_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            factory,
            whip,
            state_tx,
            quality_tx,
            active: Mutex::new(Active::default()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn quality(&self) -> watch::Receiver<Option<TransportQuality>> {
        self.quality_tx.subscribe()
    }

    /// Acquire the microphone, run the WHIP exchange and wait for the transport.
    pub async fn connect(
        &self,
        session_id: &str,
        capture: &AudioCapture,
    ) -> Result<Negotiated, NegotiationError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Connecting);
        info!("Negotiating connection for session {}", session_id);

        match self.run_exchange(session_id, capture, generation).await {
            Ok(negotiated) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    return Err(NegotiationError::Cancelled);
                }
                self.state_tx.send_replace(ConnectionState::Connected);
                info!("Connection established for session {}", negotiated.session_id);
                Ok(negotiated)
            }
            Err(NegotiationError::Cancelled) => Err(NegotiationError::Cancelled),
            Err(e) => {
                error!("Negotiation failed: {}", e);
                self.release_peer().await;
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.state_tx.send_replace(ConnectionState::Failed);
                }
                Err(e)
            }
        }
    }

    async fn run_exchange(
        &self,
        session_id: &str,
        capture: &AudioCapture,
        generation: u64,
    ) -> Result<Negotiated, NegotiationError> {
        // (a) local audio under raw constraints
        let stream = capture.start().await?;
        let track = stream.audio_track().ok_or_else(|| {
            NegotiationError::OfferCreationFailed("stream has no audio track".to_string())
        })?;

        let peer = self.factory.create(&self.config.ice_servers).await?;
        {
            let mut active = self.active.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(active);
                peer.close().await;
                return Err(NegotiationError::Cancelled);
            }
            active.peer = Some(peer.clone());
        }

        peer.add_audio_track(track).await?;

        // (b) offer
        let mut gathering = peer.ice_gathering_state();
        peer.create_offer().await?;

        // (c) full ICE gathering; the endpoint takes no trickled candidates
        match tokio::time::timeout(
            self.config.ice_gathering_timeout,
            gathering.wait_for(|s| *s == IceGatheringState::Complete),
        )
        .await
        {
            Ok(Ok(_)) => debug!("ICE gathering complete"),
            Ok(Err(_)) => {
                return Err(NegotiationError::OfferCreationFailed(
                    "peer closed during ICE gathering".to_string(),
                ))
            }
            Err(_) => {
                return Err(NegotiationError::OfferCreationFailed(format!(
                    "ICE gathering did not complete within {:?}",
                    self.config.ice_gathering_timeout
                )))
            }
        }
        self.ensure_current(generation)?;

        let offer = peer.local_description().await.ok_or_else(|| {
            NegotiationError::OfferCreationFailed("no local description".to_string())
        })?;
        debug!("Offer carries {} candidate(s)", sdp::candidate_count(&offer));

        // (d) single-shot POST
        let answer = self.whip.post_offer(session_id, &offer).await?;
        self.ensure_current(generation)?;

        // (e) answer
        sdp::validate_answer(&answer.sdp)?;
        let mut transport = peer.transport_state();
        peer.set_remote_answer(&answer.sdp).await?;

        let reached = tokio::time::timeout(
            self.config.connect_timeout,
            transport.wait_for(|s| {
                matches!(
                    s,
                    TransportState::Connected | TransportState::Failed | TransportState::Closed
                )
            }),
        )
        .await
        .map(|r| r.map(|state| *state));

        match reached {
            Ok(Ok(TransportState::Connected)) => {}
            Ok(Ok(state)) => {
                return Err(NegotiationError::TransportFailure(format!(
                    "transport reached {:?} before connecting",
                    state
                )))
            }
            Ok(Err(_)) => {
                return Err(NegotiationError::TransportFailure(
                    "peer dropped before connecting".to_string(),
                ))
            }
            Err(_) => {
                return Err(NegotiationError::TransportFailure(format!(
                    "transport not connected within {:?}",
                    self.config.connect_timeout
                )))
            }
        }
        self.ensure_current(generation)?;

        self.spawn_monitors(peer, generation).await;

        let session_id = match answer.session_id {
            Some(assigned) if assigned != session_id => {
                info!("Media server assigned session id {}", assigned);
                assigned
            }
            _ => session_id.to_string(),
        };

        Ok(Negotiated {
            session_id,
            whip_resource: answer.location,
        })
    }

    fn ensure_current(&self, generation: u64) -> Result<(), NegotiationError> {
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(NegotiationError::Cancelled);
        }
        Ok(())
    }

    async fn spawn_monitors(&self, peer: Arc<dyn PeerConnection>, generation: u64) {
        let quality = {
            let peer = peer.clone();
            let quality_tx = self.quality_tx.clone();
            let interval = self.config.quality_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(stats) = peer.stats().await else {
                        continue;
                    };
                    let quality = match stats.round_trip_time_ms {
                        Some(rtt) => ConnectionQuality::from_round_trip_ms(rtt),
                        None => continue,
                    };
                    quality_tx.send_replace(Some(TransportQuality {
                        quality,
                        stats,
                        sampled_at: Utc::now(),
                    }));
                }
            })
        };

        let watcher = {
            let mut transport = peer.transport_state();
            let state_tx = self.state_tx.clone();
            tokio::spawn(async move {
                while transport.changed().await.is_ok() {
                    let state = *transport.borrow_and_update();
                    if matches!(state, TransportState::Failed | TransportState::Disconnected) {
                        warn!("Transport left connected state: {:?}", state);
                        state_tx.send_if_modified(|current| {
                            if *current == ConnectionState::Connected {
                                *current = ConnectionState::Failed;
                                true
                            } else {
                                false
                            }
                        });
                        break;
                    }
                }
            })
        };

        let mut active = self.active.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            quality.abort();
            watcher.abort();
            return;
        }
        active.tasks.push(quality);
        active.tasks.push(watcher);
    }

    async fn release_peer(&self) {
        let (peer, tasks) = {
            let mut active = self.active.lock().await;
            (active.peer.take(), std::mem::take(&mut active.tasks))
        };

        for task in tasks {
            task.abort();
        }
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    /// Close the transport and stop the samplers. Idempotent; also cancels
    /// an in-flight `connect`.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.release_peer().await;
        self.quality_tx.send_replace(None);

        if self.current_state() != ConnectionState::Disconnected {
            info!("Connection closed");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub async fn has_peer(&self) -> bool {
        self.active.lock().await.peer.is_some()
    }
}
