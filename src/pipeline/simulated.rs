//! Timer-driven pipeline for UI development without a backend.
//!
//! Walks a fixed script of stages, one per timer tick. Inbound events are
//! ignored apart from errors.

use super::machine::{PipelineEffect, PipelineTracker};
use super::state::{
    idle_services, PipelineSnapshot, PipelineState, PipelineStep, ServiceState, ServiceStatus,
    ServiceStates,
};
use crate::signaling::{InboundEvent, ServiceKind};
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

const SCRIPT: [(PipelineStep, f32, Option<ServiceKind>); 6] = [
    (PipelineStep::Listening, 0.1, None),
    (PipelineStep::SttProcessing, 0.3, Some(ServiceKind::Stt)),
    (PipelineStep::LlmProcessing, 0.5, Some(ServiceKind::Llm)),
    (PipelineStep::TtsProcessing, 0.7, Some(ServiceKind::Tts)),
    (PipelineStep::ReceivingResponse, 0.9, None),
    (PipelineStep::Complete, 1.0, None),
];

pub struct SimulatedPipeline {
    state: PipelineState,
    services: ServiceStates,
    /// Index into `SCRIPT` of the current stage
    position: Option<usize>,
    stage_duration: Duration,
}

impl SimulatedPipeline {
    pub fn new(stage_duration: Duration) -> Self {
        Self {
            state: PipelineState::default(),
            services: idle_services(0),
            position: None,
            stage_duration,
        }
    }

    fn enter(&mut self, index: usize) {
        let (step, progress, service) = SCRIPT[index];
        let now = Utc::now();

        // Mark the previous service stage finished
        if let Some(Some(prev)) = self.position.map(|p| SCRIPT[p].2) {
            if let Some(entry) = self.services.get_mut(&prev) {
                entry.status = ServiceStatus::Complete;
                entry.progress = 1.0;
                entry.completed_at = Some(now);
                entry.updated_at = Some(now);
            }
        }
        if let Some(kind) = service {
            let cycle = self.state.cycle_count;
            let entry = self
                .services
                .entry(kind)
                .or_insert_with(|| ServiceState::idle(cycle));
            entry.status = ServiceStatus::Executing;
            entry.started_at = Some(now);
            entry.updated_at = Some(now);
        }

        self.position = Some(index);
        self.state.current_step = step;
        self.state.progress = progress;
        self.state.is_processing = step.is_processing();
        debug!("Simulated pipeline at {:?}", step);
    }

    fn idle(&mut self) {
        self.position = None;
        self.state.current_step = PipelineStep::Idle;
        self.state.progress = 0.0;
        self.state.is_processing = false;
        self.services = idle_services(self.state.cycle_count);
    }
}

impl PipelineTracker for SimulatedPipeline {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state.clone(),
            services: self.services.clone(),
        }
    }

    fn handle_event(&mut self, event: &InboundEvent) -> Option<PipelineEffect> {
        if let InboundEvent::Error { message } = event {
            self.position = None;
            self.state.current_step = PipelineStep::Error;
            self.state.progress = 0.0;
            self.state.is_processing = false;
            self.state.error = Some(message.clone());
            return Some(PipelineEffect::CancelTimer);
        }
        None
    }

    fn start_listening(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = true;
        if self.position.is_some() || self.state.current_step == PipelineStep::Error {
            return None;
        }
        self.enter(0);
        Some(PipelineEffect::Schedule(self.stage_duration))
    }

    fn stop_listening(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = false;
        if self.state.current_step == PipelineStep::Listening {
            self.idle();
            return Some(PipelineEffect::CancelTimer);
        }
        None
    }

    fn on_timer(&mut self) -> Option<PipelineEffect> {
        let next = match self.position {
            Some(p) if p + 1 < SCRIPT.len() => p + 1,
            Some(_) => {
                if !self.state.is_listening {
                    return None;
                }
                self.services = idle_services(self.state.cycle_count);
                self.position = None;
                0
            }
            None => return None,
        };

        self.enter(next);
        if self.state.current_step == PipelineStep::Complete {
            self.state.cycle_count += 1;
        }
        Some(PipelineEffect::Schedule(self.stage_duration))
    }

    fn reset(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = false;
        self.state.error = None;
        self.idle();
        Some(PipelineEffect::CancelTimer)
    }

    fn clear_error(&mut self) -> Option<PipelineEffect> {
        self.state.error = None;
        if self.state.current_step == PipelineStep::Error {
            self.idle();
        }
        None
    }

    fn emergency_stop(&mut self) -> Option<PipelineEffect> {
        self.reset()
    }
}
