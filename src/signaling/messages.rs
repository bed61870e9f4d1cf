use crate::error::SignalingError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PROTOCOL_VERSION: &str = "phase2";

/// Backend service identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Stt,
    Llm,
    Tts,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Stt, ServiceKind::Llm, ServiceKind::Tts];
}

/// Service status as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireServiceStatus {
    Idle,
    Waiting,
    Executing,
    /// Older orchestrators say `processing` for `executing`
    Processing,
    Complete,
    Error,
}

/// Coarse pipeline state as reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPipelineState {
    Idle,
    Listening,
    Processing,
    SttProcessing,
    LlmProcessing,
    TtsProcessing,
    ReceivingResponse,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineStateUpdate {
    pub state: BackendPipelineState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub services: HashMap<ServiceKind, WireServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceStatusUpdate {
    pub service: ServiceKind,
    pub state: WireServiceStatus,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptUpdate {
    #[serde(default, alias = "transcript")]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    ListeningStarted,
    ListeningStopped,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedFrame {
    PipelineStateUpdate(PipelineStateUpdate),
    ServiceStatus(ServiceStatusUpdate),
    LlmResponseText {
        response_text: String,
    },
    TtsAudioChunk {
        audio_data: String,
    },
    ConversationControl {
        event: ControlEvent,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Info {
        #[serde(default)]
        message: String,
    },
    Ping,
    Pong,
    SessionConfirmed {
        #[serde(default)]
        session_id: Option<String>,
    },
    ConnectionEstablished {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Frames keyed by `event`; these carry their text in `text`
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventFrame {
    InterimTranscript(TranscriptUpdate),
    FinalTranscript(TranscriptUpdate),
    LlmResponseText {
        #[serde(alias = "response_text")]
        text: String,
    },
    TtsAudioChunk {
        audio_data: String,
    },
    ListeningStarted,
    ListeningStopped,
    ProcessingComplete,
    Greeting {
        #[serde(default)]
        text: String,
    },
    Error {
        #[serde(default, alias = "message")]
        text: Option<String>,
    },
}

/// Every inbound event, JSON and binary alike
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    PipelineState(PipelineStateUpdate),
    ServiceStatus(ServiceStatusUpdate),
    LlmResponse { text: String },
    /// Decoded TTS audio, from a JSON chunk or a binary frame
    TtsAudio { audio: Vec<u8> },
    ConversationControl(ControlEvent),
    Error { message: String },
    Info { message: String },
    /// Opening line from the assistant
    Greeting { text: String },
    Ping,
    Pong,
    SessionConfirmed { session_id: Option<String> },
    Transcript(TranscriptUpdate),
}

/// Decode one JSON text frame
pub fn parse_text(text: &str) -> Result<InboundEvent, SignalingError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))?;

    if value.get("type").is_some() {
        let frame: TypedFrame =
            serde_json::from_value(value).map_err(|e| SignalingError::Protocol(e.to_string()))?;
        return from_typed(frame);
    }

    if value.get("event").is_some() {
        let frame: EventFrame =
            serde_json::from_value(value).map_err(|e| SignalingError::Protocol(e.to_string()))?;
        return from_event(frame);
    }

    Err(SignalingError::Protocol(
        "frame has neither `type` nor `event`".to_string(),
    ))
}

fn from_event(frame: EventFrame) -> Result<InboundEvent, SignalingError> {
    Ok(match frame {
        EventFrame::InterimTranscript(mut t) => {
            t.is_final = false;
            InboundEvent::Transcript(t)
        }
        EventFrame::FinalTranscript(mut t) => {
            t.is_final = true;
            InboundEvent::Transcript(t)
        }
        EventFrame::LlmResponseText { text } => InboundEvent::LlmResponse { text },
        EventFrame::TtsAudioChunk { audio_data } => InboundEvent::TtsAudio {
            audio: decode_audio(&audio_data)?,
        },
        EventFrame::ListeningStarted => {
            InboundEvent::ConversationControl(ControlEvent::ListeningStarted)
        }
        EventFrame::ListeningStopped => {
            InboundEvent::ConversationControl(ControlEvent::ListeningStopped)
        }
        EventFrame::ProcessingComplete => InboundEvent::PipelineState(PipelineStateUpdate {
            state: BackendPipelineState::Complete,
            message: None,
            services: HashMap::new(),
        }),
        EventFrame::Greeting { text } => InboundEvent::Greeting { text },
        EventFrame::Error { text } => InboundEvent::Error {
            message: text.unwrap_or_else(|| "unspecified backend error".to_string()),
        },
    })
}

fn decode_audio(audio_data: &str) -> Result<Vec<u8>, SignalingError> {
    base64::engine::general_purpose::STANDARD
        .decode(audio_data.as_bytes())
        .map_err(|e| SignalingError::Protocol(format!("audio chunk: {}", e)))
}

fn from_typed(frame: TypedFrame) -> Result<InboundEvent, SignalingError> {
    Ok(match frame {
        TypedFrame::PipelineStateUpdate(update) => InboundEvent::PipelineState(update),
        TypedFrame::ServiceStatus(update) => InboundEvent::ServiceStatus(update),
        TypedFrame::LlmResponseText { response_text } => InboundEvent::LlmResponse {
            text: response_text,
        },
        TypedFrame::TtsAudioChunk { audio_data } => InboundEvent::TtsAudio {
            audio: decode_audio(&audio_data)?,
        },
        TypedFrame::ConversationControl { event } => InboundEvent::ConversationControl(event),
        TypedFrame::Error { message, error } => InboundEvent::Error {
            message: message
                .or(error)
                .unwrap_or_else(|| "unspecified backend error".to_string()),
        },
        TypedFrame::Info { message } => InboundEvent::Info { message },
        TypedFrame::Ping => InboundEvent::Ping,
        TypedFrame::Pong => InboundEvent::Pong,
        TypedFrame::SessionConfirmed { session_id }
        | TypedFrame::ConnectionEstablished { session_id } => {
            InboundEvent::SessionConfirmed { session_id }
        }
    })
}

/// Outbound messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Typed(TypedOutbound),
    Event(EventOutbound),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedOutbound {
    SessionInfo { session_id: String, version: String },
    Ping,
    Pong,
    Shutdown { session_id: String, timestamp: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventOutbound {
    StartListening {
        session_id: String,
        timestamp: String,
    },
    StopListening {
        session_id: String,
        timestamp: String,
    },
    TriggerLlm {
        final_transcript: String,
        session_id: String,
        timestamp: String,
    },
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl OutboundMessage {
    pub fn session_info(session_id: &str) -> Self {
        OutboundMessage::Typed(TypedOutbound::SessionInfo {
            session_id: session_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        })
    }

    pub fn ping() -> Self {
        OutboundMessage::Typed(TypedOutbound::Ping)
    }

    pub fn pong() -> Self {
        OutboundMessage::Typed(TypedOutbound::Pong)
    }

    pub fn shutdown(session_id: &str) -> Self {
        OutboundMessage::Typed(TypedOutbound::Shutdown {
            session_id: session_id.to_string(),
            timestamp: now(),
        })
    }

    pub fn start_listening(session_id: &str) -> Self {
        OutboundMessage::Event(EventOutbound::StartListening {
            session_id: session_id.to_string(),
            timestamp: now(),
        })
    }

    pub fn stop_listening(session_id: &str) -> Self {
        OutboundMessage::Event(EventOutbound::StopListening {
            session_id: session_id.to_string(),
            timestamp: now(),
        })
    }

    pub fn trigger_llm(session_id: &str, final_transcript: &str) -> Self {
        OutboundMessage::Event(EventOutbound::TriggerLlm {
            final_transcript: final_transcript.to_string(),
            session_id: session_id.to_string(),
            timestamp: now(),
        })
    }

    pub fn to_json(&self) -> String {
        // Plain enums of strings always serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_status_parses() {
        let event = parse_text(
            r#"{"type":"service_status","service":"llm","state":"executing","progress":0.5,"session_id":"s","timestamp":"t"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            InboundEvent::ServiceStatus(ServiceStatusUpdate {
                service: ServiceKind::Llm,
                state: WireServiceStatus::Executing,
                progress: Some(0.5),
                message: None,
            })
        );
    }

    #[test]
    fn pipeline_update_with_services() {
        let event = parse_text(
            r#"{"type":"pipeline_state_update","state":"processing","services":{"stt":"complete","llm":"executing","tts":"idle"}}"#,
        )
        .unwrap();

        match event {
            InboundEvent::PipelineState(update) => {
                assert_eq!(update.state, BackendPipelineState::Processing);
                assert_eq!(update.services[&ServiceKind::Llm], WireServiceStatus::Executing);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn event_keyed_transcripts() {
        let interim = parse_text(r#"{"event":"interim_transcript","text":"hel"}"#).unwrap();
        let final_ = parse_text(
            r#"{"event":"final_transcript","transcript":"hello","confidence":0.9}"#,
        )
        .unwrap();

        assert!(matches!(interim, InboundEvent::Transcript(ref t) if !t.is_final && t.text == "hel"));
        assert!(matches!(final_, InboundEvent::Transcript(ref t) if t.is_final && t.text == "hello"));
    }

    #[test]
    fn event_keyed_replies_and_audio() {
        assert_eq!(
            parse_text(r#"{"event":"llm_response_text","text":"Sunny","session_id":"s"}"#).unwrap(),
            InboundEvent::LlmResponse { text: "Sunny".into() }
        );
        assert_eq!(
            parse_text(r#"{"event":"tts_audio_chunk","audio_data":"AQID"}"#).unwrap(),
            InboundEvent::TtsAudio { audio: vec![1, 2, 3] }
        );
        assert_eq!(
            parse_text(r#"{"event":"greeting","text":"Hello! How may I help you today?"}"#)
                .unwrap(),
            InboundEvent::Greeting {
                text: "Hello! How may I help you today?".into()
            }
        );
    }

    #[test]
    fn event_keyed_control_and_errors() {
        assert_eq!(
            parse_text(r#"{"event":"listening_started","session_id":"s"}"#).unwrap(),
            InboundEvent::ConversationControl(ControlEvent::ListeningStarted)
        );
        assert_eq!(
            parse_text(r#"{"event":"error","text":"llm timeout"}"#).unwrap(),
            InboundEvent::Error { message: "llm timeout".into() }
        );
        assert_eq!(
            parse_text(r#"{"event":"error"}"#).unwrap(),
            InboundEvent::Error { message: "unspecified backend error".into() }
        );
        assert!(matches!(
            parse_text(r#"{"event":"processing_complete","text":"done"}"#).unwrap(),
            InboundEvent::PipelineState(PipelineStateUpdate {
                state: BackendPipelineState::Complete,
                ..
            })
        ));
    }

    #[test]
    fn bad_event_audio_is_a_protocol_error() {
        assert!(matches!(
            parse_text(r#"{"event":"tts_audio_chunk","audio_data":"%%%"}"#),
            Err(SignalingError::Protocol(_))
        ));
        assert!(matches!(
            parse_text(r#"{"event":"dance"}"#),
            Err(SignalingError::Protocol(_))
        ));
    }

    #[test]
    fn tts_chunk_is_base64_decoded() {
        let event = parse_text(r#"{"type":"tts_audio_chunk","audio_data":"AQID"}"#).unwrap();
        assert_eq!(event, InboundEvent::TtsAudio { audio: vec![1, 2, 3] });
    }

    #[test]
    fn error_accepts_either_field() {
        assert_eq!(
            parse_text(r#"{"type":"error","error":"stt down","code":"E1"}"#).unwrap(),
            InboundEvent::Error { message: "stt down".into() }
        );
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for bad in [
            "not json",
            r#"{"foo":1}"#,
            r#"{"type":"unknown_kind"}"#,
            r#"{"type":"service_status","service":"gpu"}"#,
        ] {
            assert!(matches!(parse_text(bad), Err(SignalingError::Protocol(_))), "{bad}");
        }
    }

    #[test]
    fn outbound_shapes() {
        let v: serde_json::Value =
            serde_json::from_str(&OutboundMessage::session_info("abc").to_json()).unwrap();
        assert_eq!(v["type"], "session_info");
        assert_eq!(v["session_id"], "abc");
        assert_eq!(v["version"], PROTOCOL_VERSION);

        let v: serde_json::Value =
            serde_json::from_str(&OutboundMessage::trigger_llm("abc", "hi there").to_json())
                .unwrap();
        assert_eq!(v["event"], "trigger_llm");
        assert_eq!(v["final_transcript"], "hi there");
        assert!(v.get("type").is_none());

        assert_eq!(OutboundMessage::ping().to_json(), r#"{"type":"ping"}"#);
    }
}
