use super::config::SessionConfig;
use super::snapshot::SessionSnapshot;
use crate::audio::{AudioCapture, AudioSample, MediaDevices};
use crate::error::{
    CaptureError, ErrorInfo, ErrorKind, NegotiationError, SessionError, SignalingError,
};
use crate::negotiation::{
    ConnectionNegotiator, ConnectionState, PeerConnectionFactory, TransportQuality,
};
use crate::pipeline::{PipelineEffect, PipelineStateMachine, PipelineTracker};
use crate::signaling::{
    ChannelEvent, InboundEvent, OutboundMessage, ReconnectDecision, ReconnectPolicy,
    SignalingChannel, SignalingConnector, ABNORMAL_CLOSURE,
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queued TTS chunks per subscriber before the slowest one lags
const TTS_BUFFER: usize = 256;

/// One decoded TTS audio chunk.
///
/// `sequence` counts chunks in arrival order within one session, starting
/// at 0; playing them in sequence order reproduces the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsChunk {
    pub session_id: String,
    pub sequence: u64,
    pub audio: Bytes,
}

/// Mutable session context, guarded by one lock and never held across
/// network waits.
struct Inner {
    /// Set once `start()` has fully succeeded
    session_id: Option<String>,
    channel: Option<SignalingChannel>,
    tracker: Box<dyn PipelineTracker>,
    /// Pending pipeline timer
    relisten: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
    transport_watch: Option<JoinHandle<()>>,
    signaling_policy: ReconnectPolicy,
    transport_policy: ReconnectPolicy,
    tts_sequence: u64,
    stopping: bool,
    run_token: CancellationToken,
}

struct Shared {
    config: SessionConfig,
    capture: AudioCapture,
    negotiator: ConnectionNegotiator,
    connector: Arc<dyn SignalingConnector>,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    tts_tx: broadcast::Sender<TtsChunk>,
    /// Serializes start against teardown
    run_lock: Mutex<()>,
    /// Parent of every run token; cancelled when the session is dropped
    lifetime: CancellationToken,
}

/// Top-level coordinator for one voice session.
///
/// Owns the microphone capture, the peer connection negotiator and the
/// signaling channel. Consumers only see published snapshots.
pub struct VoiceSession {
    shared: Arc<Shared>,
    monitor: JoinHandle<()>,
}

impl VoiceSession {
    /// Create an idle session driven by the event-driven pipeline machine.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Result<Self, SessionError> {
        let tracker = Box::new(PipelineStateMachine::new(config.relisten_delay));
        Self::with_tracker(config, devices, peers, connector, tracker)
    }

    pub fn with_tracker(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        connector: Arc<dyn SignalingConnector>,
        tracker: Box<dyn PipelineTracker>,
    ) -> Result<Self, SessionError> {
        let capture = AudioCapture::new(devices, config.capture.clone(), config.sample_interval);
        let negotiator = ConnectionNegotiator::new(config.negotiator.clone(), peers)?;

        let lifetime = CancellationToken::new();
        let mut snapshot = SessionSnapshot::default();
        snapshot.pipeline = tracker.snapshot();
        let (snapshot_tx, _) = watch::channel(snapshot);
        let (tts_tx, _) = broadcast::channel(TTS_BUFFER);

        let inner = Inner {
            session_id: None,
            channel: None,
            tracker,
            relisten: None,
            driver: None,
            transport_watch: None,
            signaling_policy: ReconnectPolicy::single(config.reconnect_delay),
            transport_policy: ReconnectPolicy::single(config.reconnect_delay),
            tts_sequence: 0,
            stopping: false,
            run_token: lifetime.child_token(),
        };

        let state = negotiator.state();
        let quality = negotiator.quality();
        let levels = capture.levels();

        let shared = Arc::new(Shared {
            config,
            capture,
            negotiator,
            connector,
            inner: Mutex::new(inner),
            snapshot_tx,
            tts_tx,
            run_lock: Mutex::new(()),
            lifetime,
        });

        let monitor = tokio::spawn(run_monitor(Arc::downgrade(&shared), state, quality, levels));

        Ok(Self { shared, monitor })
    }

    /// Capture, negotiate, then open signaling. Returns the session id in use.
    ///
    /// A no-op returning the current id when already active. Any failure
    /// releases whatever was acquired and is retained in the snapshot.
    pub async fn start(&self) -> Result<String, SessionError> {
        let shared = &self.shared;
        let _run = shared.run_lock.lock().await;

        let token = {
            let mut inner = shared.inner.lock().await;
            if let Some(id) = inner.session_id.clone() {
                warn!("Session {} already active", id);
                return Ok(id);
            }

            inner.run_token = shared.lifetime.child_token();
            inner.stopping = false;
            inner.signaling_policy = ReconnectPolicy::single(shared.config.reconnect_delay);
            inner.transport_policy = ReconnectPolicy::single(shared.config.reconnect_delay);
            inner.tts_sequence = 0;
            let effect = inner.tracker.reset();
            shared.apply_effect(&mut inner, effect);
            shared.publish_pipeline(&inner);
            inner.run_token.clone()
        };

        let requested = SessionConfig::new_session_id();
        shared.snapshot_tx.send_modify(|snap| {
            snap.session_id = Some(requested.clone());
            snap.created_at = Some(Utc::now());
            snap.error = None;
            snap.transcript.clear();
            snap.interim_transcript.clear();
            snap.ai_response = None;
            snap.history.clear();
        });
        info!("Starting voice session {}", requested);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = shared.establish(&requested) => result,
        };

        match outcome {
            Ok((session_id, mut channel, events)) => {
                let mut inner = shared.inner.lock().await;
                if token.is_cancelled() {
                    drop(inner);
                    channel.close().await;
                    return Err(SessionError::Cancelled);
                }

                inner.session_id = Some(session_id.clone());
                inner.channel = Some(channel);
                inner.driver = Some(tokio::spawn(drive(
                    Arc::clone(shared),
                    events,
                    token.clone(),
                )));
                inner.transport_watch =
                    Some(tokio::spawn(watch_transport(Arc::clone(shared), token.clone())));
                drop(inner);

                shared.snapshot_tx.send_modify(|snap| {
                    snap.session_id = Some(session_id.clone());
                    snap.is_active = true;
                });
                shared.publish_live();
                info!("Voice session {} started", session_id);
                Ok(session_id)
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                info!("Session start cancelled");
                Err(SessionError::Cancelled)
            }
            Err(e) => {
                error!("Session start failed: {}", e);
                shared.release_after_failed_start().await;
                shared.record_error(&e);
                shared.publish_live();
                Err(e)
            }
        }
    }

    /// Graceful teardown. Idempotent, safe from any state, and cancels an
    /// in-flight `start()`.
    pub async fn stop(&self) {
        self.shutdown(false).await;
    }

    /// Like `stop()`, but first abandons the pipeline cycle in flight
    pub async fn emergency_stop(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, emergency: bool) {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.lock().await;
            inner.stopping = true;
            inner.run_token.cancel();
            if emergency {
                let effect = inner.tracker.emergency_stop();
                shared.apply_effect(&mut inner, effect);
                shared.publish_pipeline(&inner);
            }
        }

        let _run = shared.run_lock.lock().await;
        shared.teardown().await;
    }

    /// Ask the orchestrator to listen and start a listening phase
    pub async fn start_listening(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        shared.send(&inner, |id| OutboundMessage::start_listening(id))?;

        let effect = inner.tracker.start_listening();
        shared.apply_effect(&mut inner, effect);
        shared.publish_pipeline(&inner);
        Ok(())
    }

    pub async fn stop_listening(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        shared.send(&inner, |id| OutboundMessage::stop_listening(id))?;

        let effect = inner.tracker.stop_listening();
        shared.apply_effect(&mut inner, effect);
        shared.publish_pipeline(&inner);
        Ok(())
    }

    /// Hand the best available transcript to the LLM
    pub async fn trigger_llm(&self) -> Result<(), SessionError> {
        let transcript = self.shared.snapshot_tx.borrow().best_transcript().to_string();
        if transcript.trim().is_empty() {
            warn!("Triggering LLM with an empty transcript");
        }

        let inner = self.shared.inner.lock().await;
        self.shared
            .send(&inner, |id| OutboundMessage::trigger_llm(id, &transcript))
    }

    /// Local reset of the pipeline; nothing is sent
    pub async fn reset_pipeline(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let effect = inner.tracker.reset();
        shared.apply_effect(&mut inner, effect);
        shared.publish_pipeline(&inner);
    }

    /// Clear both the pipeline error and the session error
    pub async fn clear_error(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let effect = inner.tracker.clear_error();
        shared.apply_effect(&mut inner, effect);
        shared.publish_pipeline(&inner);
        shared.snapshot_tx.send_modify(|snap| snap.error = None);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.publish_live();
        self.shared.snapshot_tx.borrow().clone()
    }

    /// TTS audio from the orchestrator, in arrival order. Chunks sent
    /// before subscribing are not replayed.
    pub fn tts_audio(&self) -> broadcast::Receiver<TtsChunk> {
        self.shared.tts_tx.subscribe()
    }

    pub fn audio_levels(&self) -> watch::Receiver<AudioSample> {
        self.shared.capture.levels()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.negotiator.current_state()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.shared.inner.lock().await.session_id.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.shared.inner.lock().await.session_id.is_some()
    }

    pub async fn is_capturing(&self) -> bool {
        self.shared.capture.is_active().await
    }

    pub async fn is_channel_open(&self) -> bool {
        self.shared
            .inner
            .lock()
            .await
            .channel
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shared.lifetime.cancel();
        self.monitor.abort();
        // The async teardown cannot run here; release what can be released
        self.shared.capture.release_now();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move { shared.negotiator.close().await });
        }
    }
}

impl Shared {
    async fn establish(
        &self,
        requested: &str,
    ) -> Result<(String, SignalingChannel, mpsc::UnboundedReceiver<ChannelEvent>), SessionError>
    {
        let negotiated = self.negotiator.connect(requested, &self.capture).await?;
        let (channel, events) = SignalingChannel::open(
            self.connector.as_ref(),
            &self.config.channel,
            &negotiated.session_id,
        )
        .await?;
        Ok((negotiated.session_id, channel, events))
    }

    /// Undo a partial start. A negotiation failure keeps the `Failed` state
    /// since the negotiator already released its peer.
    async fn release_after_failed_start(&self) {
        if self.negotiator.has_peer().await {
            self.negotiator.close().await;
        }
        self.capture.stop().await;
    }

    /// Release everything in order: pipeline timers, signaling channel,
    /// transport, microphone. Then back to idle.
    async fn teardown(self: &Arc<Self>) {
        let (channel, tasks, session_id) = {
            let mut inner = self.inner.lock().await;
            inner.stopping = true;
            inner.run_token.cancel();
            if let Some(timer) = inner.relisten.take() {
                timer.abort();
            }
            let tasks = [inner.driver.take(), inner.transport_watch.take()];
            (inner.channel.take(), tasks, inner.session_id.take())
        };

        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        if let Some(mut channel) = channel {
            channel.close().await;
        }
        self.negotiator.close().await;
        self.capture.stop().await;

        {
            let mut inner = self.inner.lock().await;
            let effect = inner.tracker.reset();
            self.apply_effect(&mut inner, effect);
            self.publish_pipeline(&inner);
        }

        self.snapshot_tx.send_modify(|snap| {
            snap.session_id = None;
            snap.created_at = None;
            snap.is_active = false;
            snap.transcript.clear();
            snap.interim_transcript.clear();
            snap.ai_response = None;
            snap.history.clear();
        });
        self.publish_live();

        if let Some(id) = session_id {
            info!("Voice session {} stopped", id);
        }
    }

    /// Declare the session failed. Runs as its own task so the teardown can
    /// abort whichever task detected the failure.
    fn spawn_fail(self: &Arc<Self>, err: SessionError, token: CancellationToken) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _run = shared.run_lock.lock().await;
            if token.is_cancelled() {
                debug!("Ignoring failure of a finished run: {}", err);
                return;
            }
            error!("Session failed: {}", err);
            shared.teardown().await;
            shared.record_error(&err);
        });
    }

    fn record_error(&self, err: &SessionError) {
        let info = ErrorInfo::from(err);
        self.snapshot_tx.send_modify(|snap| snap.error = Some(info));
    }

    fn send(
        &self,
        inner: &Inner,
        message: impl FnOnce(&str) -> OutboundMessage,
    ) -> Result<(), SessionError> {
        let session_id = inner.session_id.as_deref().ok_or(SessionError::NotActive)?;
        let channel = inner
            .channel
            .as_ref()
            .ok_or(SessionError::Signaling(SignalingError::NotOpen))?;
        channel.send(message(session_id))?;
        Ok(())
    }

    fn apply_effect(self: &Arc<Self>, inner: &mut Inner, effect: Option<PipelineEffect>) {
        match effect {
            Some(PipelineEffect::Schedule(delay)) => {
                if let Some(timer) = inner.relisten.take() {
                    timer.abort();
                }
                let shared = Arc::downgrade(self);
                inner.relisten = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = shared.upgrade() {
                        shared.fire_timer().await;
                    }
                }));
            }
            Some(PipelineEffect::CancelTimer) => {
                if let Some(timer) = inner.relisten.take() {
                    timer.abort();
                }
            }
            None => {}
        }
    }

    async fn fire_timer(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        // This task; finishing on its own
        inner.relisten = None;
        let effect = inner.tracker.on_timer();
        self.apply_effect(&mut inner, effect);
        self.publish_pipeline(&inner);
    }

    fn publish_pipeline(&self, inner: &Inner) {
        let pipeline = inner.tracker.snapshot();
        self.snapshot_tx.send_modify(|snap| snap.pipeline = pipeline);
    }

    /// Copy connection state, transport quality and level into the snapshot
    fn publish_live(&self) {
        let state = self.negotiator.current_state();
        let transport = self.negotiator.quality().borrow().clone();
        let level = self.capture.levels().borrow().level;

        self.snapshot_tx.send_if_modified(|snap| {
            let sampled = |s: &SessionSnapshot| s.transport.as_ref().map(|t| t.sampled_at);
            let before = (snap.connection_state, snap.audio_level, sampled(snap));
            snap.connection_state = state;
            snap.transport = transport;
            snap.audio_level = level;
            snap.refresh_quality();
            before != (snap.connection_state, snap.audio_level, sampled(snap))
        });
    }

    async fn on_inbound(self: &Arc<Self>, event: InboundEvent) {
        let mut inner = self.inner.lock().await;
        inner.signaling_policy.mark_healthy();

        match &event {
            InboundEvent::Transcript(update) => {
                let update = update.clone();
                self.snapshot_tx.send_modify(|snap| {
                    if update.is_final {
                        snap.transcript = update.text.clone();
                        snap.interim_transcript.clear();
                    } else {
                        snap.interim_transcript = update.text.clone();
                    }
                    snap.history
                        .transcript(&update.text, update.is_final, update.confidence);
                });
            }
            InboundEvent::LlmResponse { text } => {
                let text = text.clone();
                self.snapshot_tx.send_modify(|snap| {
                    snap.history.assistant(&text);
                    snap.ai_response = Some(text);
                });
            }
            InboundEvent::TtsAudio { audio } => {
                if let Some(session_id) = inner.session_id.clone() {
                    let chunk = TtsChunk {
                        session_id,
                        sequence: inner.tts_sequence,
                        audio: Bytes::copy_from_slice(audio),
                    };
                    inner.tts_sequence += 1;
                    debug!("TTS chunk {}: {} bytes", chunk.sequence, chunk.audio.len());
                    // No subscribers is fine
                    let _ = self.tts_tx.send(chunk);
                }
            }
            InboundEvent::Greeting { text } => {
                info!("Greeting: {}", text);
                let text = text.clone();
                self.snapshot_tx.send_modify(|snap| snap.history.assistant(&text));
            }
            InboundEvent::Info { message } => info!("Orchestrator: {}", message),
            InboundEvent::SessionConfirmed { session_id } => {
                info!("Orchestrator confirmed session {:?}", session_id)
            }
            InboundEvent::Error { message } => error!("Orchestrator error: {}", message),
            _ => {}
        }

        let effect = inner.tracker.handle_event(&event);
        self.apply_effect(&mut inner, effect);
        self.publish_pipeline(&inner);
    }

    async fn on_channel_closed(&self, code: u16) -> ReconnectDecision {
        let mut inner = self.inner.lock().await;
        inner.channel = None;
        let stopping = inner.stopping;
        inner.signaling_policy.on_close(code, stopping)
    }

    /// Open a replacement channel. `None` when the session stopped meanwhile.
    async fn reopen(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, SignalingError> {
        let session_id = match self.inner.lock().await.session_id.clone() {
            Some(id) => id,
            None => return Ok(None),
        };

        let (mut channel, events) = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            opened = SignalingChannel::open(
                self.connector.as_ref(),
                &self.config.channel,
                &session_id,
            ) => opened?,
        };

        let mut inner = self.inner.lock().await;
        if token.is_cancelled() || inner.stopping {
            drop(inner);
            channel.close().await;
            return Ok(None);
        }
        inner.channel = Some(channel);
        info!("Signaling channel re-established for session {}", session_id);
        Ok(Some(events))
    }
}

/// Dispatch channel events in arrival order and own the reconnect cycle
async fn drive(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => event,
        };

        let (code, reason) = match event {
            Some(ChannelEvent::Inbound(event)) => {
                shared.on_inbound(event).await;
                continue;
            }
            Some(ChannelEvent::ProtocolError(message)) => {
                debug!("Skipped malformed frame: {}", message);
                continue;
            }
            Some(ChannelEvent::Closed { code, reason }) => (code, reason),
            None => (ABNORMAL_CLOSURE, "event stream ended".to_string()),
        };

        let mut decision = shared.on_channel_closed(code).await;
        events = loop {
            match decision {
                ReconnectDecision::Ignore => {
                    info!("Signaling channel closed ({})", code);
                    return;
                }
                ReconnectDecision::GiveUp => {
                    let err = SignalingError::ClosedUnexpectedly {
                        code,
                        reason: reason.clone(),
                    };
                    shared.spawn_fail(err.into(), token.clone());
                    return;
                }
                ReconnectDecision::Retry(delay) => {
                    warn!(
                        "Signaling closed unexpectedly ({} {}), reconnecting in {:?}",
                        code, reason, delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match shared.reopen(&token).await {
                        Ok(Some(events)) => break events,
                        Ok(None) => return,
                        Err(e) => {
                            warn!("Signaling reconnect failed: {}", e);
                            decision = shared.inner.lock().await.signaling_policy.on_failure();
                        }
                    }
                }
            }
        };
    }
}

/// One renegotiation per failure streak, then the session fails
async fn watch_transport(shared: Arc<Shared>, token: CancellationToken) {
    let mut state = shared.negotiator.state();
    // Set after a renegotiation; the budget returns once the link holds
    let mut settling = false;

    loop {
        let stable_for = shared.config.transport_stable_period;
        let failed = tokio::select! {
            _ = token.cancelled() => return,
            reached = state.wait_for(|s| *s == ConnectionState::Failed) => Some(reached.is_ok()),
            _ = tokio::time::sleep(stable_for), if settling => None,
        };
        let Some(failed) = failed else {
            debug!("Transport stable for {:?}", stable_for);
            shared.inner.lock().await.transport_policy.mark_healthy();
            settling = false;
            continue;
        };
        if !failed {
            return;
        }

        let (decision, session_id) = {
            let mut inner = shared.inner.lock().await;
            if inner.stopping {
                return;
            }
            (inner.transport_policy.on_failure(), inner.session_id.clone())
        };
        let Some(session_id) = session_id else {
            return;
        };

        let delay = match decision {
            ReconnectDecision::Retry(delay) => delay,
            ReconnectDecision::GiveUp | ReconnectDecision::Ignore => {
                let err = NegotiationError::TransportFailure("transport failed".to_string());
                shared.spawn_fail(err.into(), token.clone());
                return;
            }
        };

        warn!("Transport failed, renegotiating in {:?}", delay);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        shared.negotiator.close().await;
        let renegotiated = tokio::select! {
            _ = token.cancelled() => return,
            result = shared.negotiator.connect(&session_id, &shared.capture) => result,
        };

        match renegotiated {
            Ok(_) => {
                info!("Transport renegotiated for session {}", session_id);
                settling = true;
                shared.publish_live();
            }
            Err(NegotiationError::Cancelled)
            | Err(NegotiationError::MediaAcquisitionFailed(CaptureError::Cancelled)) => return,
            Err(e) => {
                let err = NegotiationError::TransportFailure(format!(
                    "renegotiation failed: {}",
                    e
                ));
                shared.spawn_fail(err.into(), token.clone());
                return;
            }
        }
    }
}

/// Mirror negotiator and capture watches into the snapshot
async fn run_monitor(
    shared: Weak<Shared>,
    mut state: watch::Receiver<ConnectionState>,
    mut quality: watch::Receiver<Option<TransportQuality>>,
    mut levels: watch::Receiver<AudioSample>,
) {
    loop {
        let changed = tokio::select! {
            changed = state.changed() => changed,
            changed = quality.changed() => changed,
            changed = levels.changed() => changed,
        };
        if changed.is_err() {
            break;
        }

        match shared.upgrade() {
            Some(shared) => shared.publish_live(),
            None => break,
        }
    }
}
