use super::messages::{parse_text, InboundEvent, OutboundMessage};
use super::transport::{
    Frame, FrameSink, FrameStream, SignalingConnector, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use crate::error::SignalingError;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `close()` waits for the close frame to flush
const CLOSE_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8004/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Delivered to the channel owner, strictly in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Inbound(InboundEvent),
    /// Malformed frame; logged and otherwise ignored
    ProtocolError(String),
    Closed { code: u16, reason: String },
}

/// Duplex event channel to the orchestrator.
///
/// Three tasks per channel: a writer owning the sink, a reader owning the
/// stream, and the heartbeat. Inbound pings are answered by the reader.
pub struct SignalingChannel {
    session_id: String,
    outbox: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    awaiting_pong: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Connect and send the session bootstrap
    pub async fn open(
        connector: &dyn SignalingConnector,
        config: &ChannelConfig,
        session_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), SignalingError> {
        let connecting = connector.connect(&config.url);
        let (sink, stream) = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| {
                SignalingError::OpenFailed(format!(
                    "no connection within {:?}",
                    config.connect_timeout
                ))
            })??;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let awaiting_pong = Arc::new(AtomicBool::new(false));

        outbox
            .send(Frame::Text(OutboundMessage::session_info(session_id).to_json()))
            .map_err(|_| SignalingError::NotOpen)?;

        let writer = tokio::spawn(run_writer(sink, outbox_rx));
        let reader = tokio::spawn(run_reader(
            stream,
            events_tx,
            outbox.clone(),
            open.clone(),
            awaiting_pong.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            config.heartbeat_interval,
            outbox.clone(),
            open.clone(),
            awaiting_pong.clone(),
        ));

        info!("Signaling channel open for session {}", session_id);

        Ok((
            Self {
                session_id: session_id.to_string(),
                outbox,
                open,
                awaiting_pong,
                writer: Some(writer),
                reader: Some(reader),
                heartbeat: Some(heartbeat),
            },
            events_rx,
        ))
    }

    pub fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::NotOpen);
        }
        debug!("-> {}", message.to_json());
        self.outbox
            .send(Frame::Text(message.to_json()))
            .map_err(|_| SignalingError::NotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Graceful close: shutdown notice, then close code 1000. Idempotent.
    pub async fn close(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .outbox
                .send(Frame::Text(OutboundMessage::shutdown(&self.session_id).to_json()));
            let _ = self.outbox.send(Frame::Close {
                code: NORMAL_CLOSURE,
                reason: "Session ended".to_string(),
            });
        }

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_FLUSH, &mut writer).await.is_err() {
                warn!("Close frame not flushed in time");
                writer.abort();
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
            info!("Signaling channel closed for session {}", self.session_id);
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in [self.heartbeat.take(), self.reader.take(), self.writer.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn run_writer(mut sink: FrameSink, mut outbox: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbox.recv().await {
        let closing = matches!(frame, Frame::Close { .. });
        if let Err(e) = sink.send(frame).await {
            debug!("Signaling write failed: {}", e);
            break;
        }
        if closing {
            let _ = sink.close().await;
            break;
        }
    }
}

async fn run_reader(
    mut stream: FrameStream,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbox: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    awaiting_pong: Arc<AtomicBool>,
) {
    let (code, reason) = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break (ABNORMAL_CLOSURE, e.to_string()),
            None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
        };

        let event = match frame {
            Frame::Text(text) => match parse_text(&text) {
                Ok(InboundEvent::Ping) => {
                    let _ = outbox.send(Frame::Text(OutboundMessage::pong().to_json()));
                    continue;
                }
                Ok(InboundEvent::Pong) => {
                    awaiting_pong.store(false, Ordering::SeqCst);
                    continue;
                }
                Ok(event) => ChannelEvent::Inbound(event),
                Err(e) => {
                    warn!("Ignoring malformed frame: {}", e);
                    ChannelEvent::ProtocolError(e.to_string())
                }
            },
            Frame::Binary(data) => ChannelEvent::Inbound(InboundEvent::TtsAudio {
                audio: data.to_vec(),
            }),
            Frame::Close { code, reason } => break (code, reason),
        };

        if events.send(event).is_err() {
            return;
        }
    };

    let was_open = open.swap(false, Ordering::SeqCst);
    if was_open && code != NORMAL_CLOSURE {
        error!("Signaling channel closed unexpectedly: {} {}", code, reason);
    }
    let _ = events.send(ChannelEvent::Closed { code, reason });
}

async fn run_heartbeat(
    interval: Duration,
    outbox: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    awaiting_pong: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        ticker.tick().await;
        if !open.load(Ordering::SeqCst) {
            break;
        }

        if awaiting_pong.swap(true, Ordering::SeqCst) {
            // Logged only, the channel stays open
            warn!("No pong since last heartbeat");
        }

        if outbox
            .send(Frame::Text(OutboundMessage::ping().to_json()))
            .is_err()
        {
            break;
        }
    }
}
