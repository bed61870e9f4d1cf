use serde::Serialize;
use thiserror::Error;

/// Coarse error classification surfaced in the session snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MediaAcquisition,
    OfferCreation,
    SignalingRejected,
    RemoteAnswerInvalid,
    TransportFailure,
    ChannelClosedUnexpectedly,
    ChannelOpenFailed,
    Protocol,
    Cancelled,
    NotActive,
}

impl ErrorKind {
    /// Whether the session manager may schedule one recovery attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransportFailure | ErrorKind::ChannelClosedUnexpectedly
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture cancelled before the device was granted")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] CaptureError),

    #[error("offer creation failed: {0}")]
    OfferCreationFailed(String),

    #[error("WHIP endpoint rejected offer ({status}): {body}")]
    SignalingRejected { status: u16, body: String },

    #[error("WHIP endpoint unreachable: {0}")]
    WhipUnreachable(String),

    #[error("remote answer invalid: {0}")]
    RemoteAnswerInvalid(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("negotiation cancelled")]
    Cancelled,
}

impl NegotiationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NegotiationError::MediaAcquisitionFailed(CaptureError::Cancelled) => ErrorKind::Cancelled,
            NegotiationError::MediaAcquisitionFailed(_) => ErrorKind::MediaAcquisition,
            NegotiationError::OfferCreationFailed(_) => ErrorKind::OfferCreation,
            NegotiationError::SignalingRejected { .. } | NegotiationError::WhipUnreachable(_) => {
                ErrorKind::SignalingRejected
            }
            NegotiationError::RemoteAnswerInvalid(_) => ErrorKind::RemoteAnswerInvalid,
            NegotiationError::TransportFailure(_) => ErrorKind::TransportFailure,
            NegotiationError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("failed to open signaling channel: {0}")]
    OpenFailed(String),

    #[error("signaling channel closed unexpectedly (code {code}): {reason}")]
    ClosedUnexpectedly { code: u16, reason: String },

    #[error("malformed inbound frame: {0}")]
    Protocol(String),

    #[error("signaling channel is not open")]
    NotOpen,
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::OpenFailed(_) => ErrorKind::ChannelOpenFailed,
            SignalingError::ClosedUnexpectedly { .. } => ErrorKind::ChannelClosedUnexpectedly,
            SignalingError::Protocol(_) => ErrorKind::Protocol,
            SignalingError::NotOpen => ErrorKind::NotActive,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("session start cancelled")]
    Cancelled,

    #[error("no active session")]
    NotActive,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Capture(CaptureError::Cancelled) => ErrorKind::Cancelled,
            SessionError::Capture(_) => ErrorKind::MediaAcquisition,
            SessionError::Negotiation(e) => e.kind(),
            SessionError::Signaling(e) => e.kind(),
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::NotActive => ErrorKind::NotActive,
        }
    }
}

/// Error as retained in published state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SessionError> for ErrorInfo {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
