use crate::signaling::{ServiceKind, WireServiceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Pipeline steps in traversal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Idle,
    Listening,
    SttProcessing,
    LlmProcessing,
    TtsProcessing,
    ReceivingResponse,
    Complete,
    Error,
}

impl PipelineStep {
    /// Fixed overall progress of each step
    pub fn anchor(&self) -> f32 {
        match self {
            PipelineStep::Idle | PipelineStep::Error => 0.0,
            PipelineStep::Listening => 0.1,
            PipelineStep::SttProcessing => 0.3,
            PipelineStep::LlmProcessing => 0.5,
            PipelineStep::TtsProcessing => 0.7,
            PipelineStep::ReceivingResponse => 0.9,
            PipelineStep::Complete => 1.0,
        }
    }

    pub fn for_service(service: ServiceKind) -> Self {
        match service {
            ServiceKind::Stt => PipelineStep::SttProcessing,
            ServiceKind::Llm => PipelineStep::LlmProcessing,
            ServiceKind::Tts => PipelineStep::TtsProcessing,
        }
    }

    /// `(lower, upper)` of a service step's band: previous anchor to own anchor
    pub fn band(&self) -> (f32, f32) {
        match self {
            PipelineStep::SttProcessing => (0.1, 0.3),
            PipelineStep::LlmProcessing => (0.3, 0.5),
            PipelineStep::TtsProcessing => (0.5, 0.7),
            other => (other.anchor(), other.anchor()),
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            PipelineStep::SttProcessing
                | PipelineStep::LlmProcessing
                | PipelineStep::TtsProcessing
                | PipelineStep::ReceivingResponse
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Idle,
    Waiting,
    Executing,
    Complete,
    Error,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Complete | ServiceStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceStatus::Waiting | ServiceStatus::Executing)
    }
}

impl From<WireServiceStatus> for ServiceStatus {
    fn from(status: WireServiceStatus) -> Self {
        match status {
            WireServiceStatus::Idle => ServiceStatus::Idle,
            WireServiceStatus::Waiting => ServiceStatus::Waiting,
            WireServiceStatus::Executing | WireServiceStatus::Processing => {
                ServiceStatus::Executing
            }
            WireServiceStatus::Complete => ServiceStatus::Complete,
            WireServiceStatus::Error => ServiceStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub progress: f32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub error: Option<String>,
    /// Pipeline cycle this state belongs to
    pub cycle: u64,
}

impl ServiceState {
    pub fn idle(cycle: u64) -> Self {
        Self {
            status: ServiceStatus::Idle,
            progress: 0.0,
            started_at: None,
            updated_at: None,
            completed_at: None,
            message: None,
            error: None,
            cycle,
        }
    }
}

pub type ServiceStates = HashMap<ServiceKind, ServiceState>;

pub fn idle_services(cycle: u64) -> ServiceStates {
    ServiceKind::ALL
        .iter()
        .map(|kind| (*kind, ServiceState::idle(cycle)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineState {
    pub current_step: PipelineStep,
    /// Overall progress, 0-1
    pub progress: f32,
    /// Listening intent; drives the automatic return to listening
    pub is_listening: bool,
    pub is_processing: bool,
    pub cycle_count: u64,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            current_step: PipelineStep::Idle,
            progress: 0.0,
            is_listening: false,
            is_processing: false,
            cycle_count: 0,
            message: None,
            error: None,
        }
    }
}

/// Read-only view of a tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub services: ServiceStates,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            state: PipelineState::default(),
            services: idle_services(0),
        }
    }
}
