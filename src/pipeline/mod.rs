//! Conversation pipeline tracking
//!
//! The event-driven machine mirrors what the orchestrator reports. The
//! simulated flow is only built with the `simulation` feature.

pub mod machine;
#[cfg(feature = "simulation")]
pub mod simulated;
pub mod state;

pub use machine::{PipelineEffect, PipelineStateMachine, PipelineTracker};
#[cfg(feature = "simulation")]
pub use simulated::SimulatedPipeline;
pub use state::{
    PipelineSnapshot, PipelineState, PipelineStep, ServiceState, ServiceStates, ServiceStatus,
};
