use crate::error::SignalingError;
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the connection drops without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Transport-level frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SignalingError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SignalingError>> + Send>>;

/// Opens the duplex connection to the orchestrator
#[async_trait::async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), SignalingError>;
}

/// WebSocket connector (tokio-tungstenite)
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait::async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), SignalingError> {
        info!("Connecting to orchestrator at {}", url);

        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::OpenFailed(e.to_string()))?;
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| SignalingError::OpenFailed(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, SignalingError>(into_message(frame))));

        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(SignalingError::ClosedUnexpectedly {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                })),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

/// Control frames are answered by tungstenite itself
fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Close(frame) => Some(match frame {
            Some(f) => Frame::Close {
                code: u16::from(f.code),
                reason: f.reason.to_string(),
            },
            None => Frame::Close {
                code: ABNORMAL_CLOSURE,
                reason: "closed without status".to_string(),
            },
        }),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}
