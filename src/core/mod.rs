//! Experiment lifecycle: configuration, the control-plane seam, the phase
//! policy and the orchestrator that drives a run.

pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod remote;
