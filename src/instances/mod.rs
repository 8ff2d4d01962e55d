//! Phase workers used by the orchestrator
//!
//! Each worker wraps one family of control-plane calls and applies the
//! deadline that fits it.

pub mod common;
pub mod provisioner;
pub mod publisher;
pub mod script_runner;
pub mod topology;
pub mod variables;
