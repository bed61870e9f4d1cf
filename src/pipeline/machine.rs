use super::state::{
    idle_services, PipelineSnapshot, PipelineState, PipelineStep, ServiceState, ServiceStatus,
    ServiceStates,
};
use crate::signaling::{
    BackendPipelineState, ControlEvent, InboundEvent, PipelineStateUpdate, ServiceKind,
    ServiceStatusUpdate,
};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timer requests a tracker hands back to its owner.
/// The owner holds at most one pipeline timer at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEffect {
    /// Call `on_timer` after the delay, replacing any pending timer
    Schedule(Duration),
    CancelTimer,
}

/// What the session manager drives. Implemented by the event-driven
/// machine and by the development-only simulated flow.
pub trait PipelineTracker: Send {
    fn snapshot(&self) -> PipelineSnapshot;

    fn handle_event(&mut self, event: &InboundEvent) -> Option<PipelineEffect>;

    fn start_listening(&mut self) -> Option<PipelineEffect>;

    fn stop_listening(&mut self) -> Option<PipelineEffect>;

    /// The scheduled timer fired
    fn on_timer(&mut self) -> Option<PipelineEffect>;

    fn reset(&mut self) -> Option<PipelineEffect>;

    fn clear_error(&mut self) -> Option<PipelineEffect>;

    /// Abandon the cycle in flight, whatever its step
    fn emergency_stop(&mut self) -> Option<PipelineEffect>;
}

/// Mirrors backend-reported progress into one normalized value.
///
/// Only inbound events and explicit user intents move it. Progress is
/// non-decreasing within a cycle; reset, error and emergency stop are the
/// only ways back to zero.
pub struct PipelineStateMachine {
    state: PipelineState,
    services: ServiceStates,
    relisten_delay: Duration,
}

impl PipelineStateMachine {
    pub fn new(relisten_delay: Duration) -> Self {
        Self {
            state: PipelineState::default(),
            services: idle_services(0),
            relisten_delay,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn services(&self) -> &ServiceStates {
        &self.services
    }

    fn set_step(&mut self, step: PipelineStep) {
        if self.state.current_step != step {
            info!(
                "Pipeline {:?} -> {:?}",
                self.state.current_step, step
            );
        }
        self.state.current_step = step;
        self.state.is_processing = step.is_processing();
    }

    fn raise_progress(&mut self, value: f32) {
        self.state.progress = self.state.progress.max(value.clamp(0.0, 1.0));
    }

    /// Start a listening phase; a completed cycle gives way to a fresh one
    fn enter_listening(&mut self) {
        match self.state.current_step {
            PipelineStep::Idle => {}
            PipelineStep::Complete => {
                self.services = idle_services(self.state.cycle_count);
                self.state.progress = 0.0;
                self.state.message = None;
            }
            _ => return,
        }
        self.set_step(PipelineStep::Listening);
        self.raise_progress(PipelineStep::Listening.anchor());
    }

    /// Move forward to `step`; never backwards within a cycle
    fn advance_to(&mut self, step: PipelineStep) -> bool {
        let current = self.state.current_step;
        if matches!(current, PipelineStep::Error | PipelineStep::Complete) || step <= current {
            return step == current;
        }

        self.set_step(step);
        self.raise_progress(step.band().0);
        true
    }

    fn complete(&mut self) -> Option<PipelineEffect> {
        if self.state.current_step == PipelineStep::Complete {
            return None;
        }

        self.set_step(PipelineStep::Complete);
        self.raise_progress(1.0);
        self.state.cycle_count += 1;
        info!("Pipeline cycle {} complete", self.state.cycle_count);

        if self.state.is_listening {
            Some(PipelineEffect::Schedule(self.relisten_delay))
        } else {
            None
        }
    }

    fn fail(&mut self, message: String) -> Option<PipelineEffect> {
        warn!("Pipeline error: {}", message);
        self.set_step(PipelineStep::Error);
        self.state.progress = 0.0;
        self.state.error = Some(message);
        Some(PipelineEffect::CancelTimer)
    }

    fn back_to_idle(&mut self) {
        self.set_step(PipelineStep::Idle);
        self.state.progress = 0.0;
        self.state.message = None;
        self.services = idle_services(self.state.cycle_count);
    }

    /// Record a service status unless that service already finished this cycle
    fn merge_service(
        &mut self,
        service: ServiceKind,
        status: ServiceStatus,
        progress: Option<f32>,
        message: Option<String>,
    ) -> bool {
        let cycle = self.state.cycle_count;
        let now = Utc::now();
        let entry = self
            .services
            .entry(service)
            .or_insert_with(|| ServiceState::idle(cycle));

        if entry.status.is_terminal() && entry.cycle == cycle {
            debug!("Ignoring {:?} update for finished {:?}", status, service);
            return false;
        }

        if entry.cycle != cycle {
            *entry = ServiceState::idle(cycle);
        }

        if status == ServiceStatus::Executing && entry.started_at.is_none() {
            entry.started_at = Some(now);
        }
        if status == ServiceStatus::Complete {
            entry.completed_at = Some(now);
            entry.progress = 1.0;
        } else if let Some(p) = progress {
            entry.progress = entry.progress.max(p.clamp(0.0, 1.0));
        }
        if status == ServiceStatus::Error {
            entry.error = message.clone();
        }
        if message.is_some() {
            entry.message = message;
        }
        entry.status = status;
        entry.updated_at = Some(now);
        true
    }

    fn on_service_status(&mut self, update: &ServiceStatusUpdate) -> Option<PipelineEffect> {
        let status = ServiceStatus::from(update.state);
        if !self.merge_service(update.service, status, update.progress, update.message.clone()) {
            return None;
        }

        let step = PipelineStep::for_service(update.service);
        let (lower, upper) = step.band();

        match status {
            ServiceStatus::Executing => {
                if self.advance_to(step) {
                    let fraction = update.progress.unwrap_or(0.0).clamp(0.0, 1.0);
                    self.raise_progress(lower + fraction * (upper - lower));
                }
                None
            }
            ServiceStatus::Complete => {
                if self.advance_to(step) {
                    self.raise_progress(upper);
                }
                None
            }
            ServiceStatus::Error => {
                let detail = update
                    .message
                    .clone()
                    .unwrap_or_else(|| "service reported an error".to_string());
                self.fail(format!("{:?} failed: {}", update.service, detail))
            }
            ServiceStatus::Idle | ServiceStatus::Waiting => None,
        }
    }

    fn on_pipeline_update(&mut self, update: &PipelineStateUpdate) -> Option<PipelineEffect> {
        for (service, status) in &update.services {
            self.merge_service(*service, ServiceStatus::from(*status), None, None);
        }
        if update.message.is_some() {
            self.state.message = update.message.clone();
        }

        match update.state {
            BackendPipelineState::Idle => {
                self.back_to_idle();
                Some(PipelineEffect::CancelTimer)
            }
            BackendPipelineState::Listening => {
                self.enter_listening();
                None
            }
            BackendPipelineState::Processing => {
                let step = self.most_advanced_active(update);
                self.advance_to(step);
                None
            }
            BackendPipelineState::SttProcessing => {
                self.advance_to(PipelineStep::SttProcessing);
                None
            }
            BackendPipelineState::LlmProcessing => {
                self.advance_to(PipelineStep::LlmProcessing);
                None
            }
            BackendPipelineState::TtsProcessing => {
                self.advance_to(PipelineStep::TtsProcessing);
                None
            }
            BackendPipelineState::ReceivingResponse => {
                if self.advance_to(PipelineStep::ReceivingResponse) {
                    self.raise_progress(PipelineStep::ReceivingResponse.anchor());
                }
                None
            }
            BackendPipelineState::Complete => self.complete(),
            BackendPipelineState::Error => {
                let message = update
                    .message
                    .clone()
                    .unwrap_or_else(|| "Pipeline error occurred".to_string());
                self.fail(message)
            }
        }
    }

    /// `processing` is resolved through the accompanying services map
    fn most_advanced_active(&self, update: &PipelineStateUpdate) -> PipelineStep {
        [ServiceKind::Tts, ServiceKind::Llm, ServiceKind::Stt]
            .into_iter()
            .find(|kind| {
                update
                    .services
                    .get(kind)
                    .map(|s| ServiceStatus::from(*s).is_active())
                    .unwrap_or(false)
            })
            .map(PipelineStep::for_service)
            .unwrap_or(PipelineStep::LlmProcessing)
    }
}

impl PipelineTracker for PipelineStateMachine {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state.clone(),
            services: self.services.clone(),
        }
    }

    fn handle_event(&mut self, event: &InboundEvent) -> Option<PipelineEffect> {
        if self.state.current_step == PipelineStep::Error {
            if !matches!(event, InboundEvent::Info { .. } | InboundEvent::Transcript(_)) {
                debug!("Pipeline in error, ignoring {:?}", event);
            }
            return None;
        }

        match event {
            InboundEvent::PipelineState(update) => self.on_pipeline_update(update),
            InboundEvent::ServiceStatus(update) => self.on_service_status(update),
            InboundEvent::TtsAudio { .. } => {
                if self.state.current_step.is_processing()
                    && self.advance_to(PipelineStep::ReceivingResponse)
                {
                    self.raise_progress(PipelineStep::ReceivingResponse.anchor());
                }
                None
            }
            InboundEvent::ConversationControl(ControlEvent::ListeningStarted) => {
                self.start_listening()
            }
            InboundEvent::ConversationControl(ControlEvent::ListeningStopped) => {
                self.stop_listening()
            }
            InboundEvent::ConversationControl(ControlEvent::Other) => None,
            InboundEvent::Error { message } => self.fail(message.clone()),
            InboundEvent::LlmResponse { .. }
            | InboundEvent::Transcript(_)
            | InboundEvent::Info { .. }
            | InboundEvent::Greeting { .. }
            | InboundEvent::Ping
            | InboundEvent::Pong
            | InboundEvent::SessionConfirmed { .. } => None,
        }
    }

    fn start_listening(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = true;
        self.enter_listening();
        None
    }

    fn stop_listening(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = false;
        if self.state.current_step == PipelineStep::Listening {
            self.back_to_idle();
        }
        Some(PipelineEffect::CancelTimer)
    }

    fn on_timer(&mut self) -> Option<PipelineEffect> {
        if self.state.current_step == PipelineStep::Complete && self.state.is_listening {
            debug!("Returning to listening after cycle {}", self.state.cycle_count);
            self.enter_listening();
        }
        None
    }

    fn reset(&mut self) -> Option<PipelineEffect> {
        self.state.is_listening = false;
        self.state.error = None;
        self.back_to_idle();
        Some(PipelineEffect::CancelTimer)
    }

    fn clear_error(&mut self) -> Option<PipelineEffect> {
        if self.state.current_step == PipelineStep::Error {
            self.back_to_idle();
        }
        self.state.error = None;
        None
    }

    fn emergency_stop(&mut self) -> Option<PipelineEffect> {
        info!("Emergency stop at {:?}", self.state.current_step);
        self.state.is_listening = false;
        self.state.error = None;
        self.back_to_idle();
        Some(PipelineEffect::CancelTimer)
    }
}
