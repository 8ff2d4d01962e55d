//! Experiment phases and the failure policy applied to them.
//!
//! Every phase is tagged [`Severity::Fatal`] or [`Severity::Soft`]. The
//! [`PhaseDriver`] is the only place the tag is interpreted: a failed fatal
//! phase stops the run, a failed soft phase is recorded and the run goes on.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::metrics::PhaseRecord;

/// How a phase failure affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Abort the run
    Fatal,
    /// Record and continue
    Soft,
}

/// Lifecycle states of one experiment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Freed,
    Allocated,
    ConfiguredGlobals,
    ConfiguredLoop,
    Imaged,
    BootParamsApplied,
    Rebooted,
    SetupRan,
    WorkloadRan,
    Collected,
    MetadataUpdated,
    Published,
    ManifestWritten,
    Terminal,
}

/// One step of the experiment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Free,
    Allocate,
    DetectTopology,
    SetGlobals,
    SetLoopVariables,
    Image,
    BootParameters,
    Reboot,
    Setup,
    Workload,
    Collect,
    AnnotateMetadata,
    Publish,
    WriteManifest,
}

impl Phase {
    /// Execution order
    pub const SEQUENCE: [Phase; 14] = [
        Phase::Free,
        Phase::Allocate,
        Phase::DetectTopology,
        Phase::SetGlobals,
        Phase::SetLoopVariables,
        Phase::Image,
        Phase::BootParameters,
        Phase::Reboot,
        Phase::Setup,
        Phase::Workload,
        Phase::Collect,
        Phase::AnnotateMetadata,
        Phase::Publish,
        Phase::WriteManifest,
    ];

    pub fn severity(self) -> Severity {
        match self {
            Phase::DetectTopology | Phase::Collect | Phase::AnnotateMetadata | Phase::Publish => Severity::Soft,
            _ => Severity::Fatal,
        }
    }

    /// State reached when the phase completes. Topology detection only
    /// informs later phases and does not move the state machine.
    pub fn target_state(self) -> Option<RunState> {
        match self {
            Phase::Free => Some(RunState::Freed),
            Phase::Allocate => Some(RunState::Allocated),
            Phase::DetectTopology => None,
            Phase::SetGlobals => Some(RunState::ConfiguredGlobals),
            Phase::SetLoopVariables => Some(RunState::ConfiguredLoop),
            Phase::Image => Some(RunState::Imaged),
            Phase::BootParameters => Some(RunState::BootParamsApplied),
            Phase::Reboot => Some(RunState::Rebooted),
            Phase::Setup => Some(RunState::SetupRan),
            Phase::Workload => Some(RunState::WorkloadRan),
            Phase::Collect => Some(RunState::Collected),
            Phase::AnnotateMetadata => Some(RunState::MetadataUpdated),
            Phase::Publish => Some(RunState::Published),
            Phase::WriteManifest => Some(RunState::ManifestWritten),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Free => "free allocation",
            Phase::Allocate => "allocate node",
            Phase::DetectTopology => "detect CPU topology",
            Phase::SetGlobals => "set global variables",
            Phase::SetLoopVariables => "set loop variables",
            Phase::Image => "apply image",
            Phase::BootParameters => "apply boot parameters",
            Phase::Reboot => "reboot node",
            Phase::Setup => "setup script",
            Phase::Workload => "workload script",
            Phase::Collect => "create energy plots",
            Phase::AnnotateMetadata => "update RO-Crate metadata",
            Phase::Publish => "publish results",
            Phase::WriteManifest => "write submission",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Successful result of a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhaseOutcome {
    Completed,
    /// Nothing to do, with the reason
    Skipped(String),
    /// Failure message
    Failed(String),
}

/// A fatal phase failure that ended the run
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub message: String,
}

impl Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.message)
    }
}

impl std::error::Error for PhaseFailure {}

/// Applies the fatal/soft policy and tracks the run state
#[derive(Debug)]
pub struct PhaseDriver {
    state: RunState,
    records: Vec<PhaseRecord>,
}

impl PhaseDriver {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PhaseRecord> {
        self.records
    }

    /// Settle the result of one phase.
    ///
    /// Returns `Err` only when a fatal phase failed; the caller must stop.
    pub fn settle<E: Display>(
        &mut self,
        phase: Phase,
        started_at: DateTime<Utc>,
        result: Result<PhaseOutcome, E>,
        duration_ms: f64,
    ) -> Result<(), PhaseFailure> {
        let outcome = match result {
            Ok(PhaseOutcome::Completed) => {
                if let Some(next) = phase.target_state() {
                    self.state = next;
                }
                PhaseOutcome::Completed
            }
            Ok(PhaseOutcome::Skipped(reason)) => {
                info!("Skipped {}: {}", phase, reason);
                PhaseOutcome::Skipped(reason)
            }
            Ok(PhaseOutcome::Failed(message)) => return self.fail(phase, started_at, message, duration_ms),
            Err(e) => return self.fail(phase, started_at, e.to_string(), duration_ms),
        };

        self.records.push(PhaseRecord {
            phase,
            severity: phase.severity(),
            outcome,
            started_at,
            duration_ms,
        });
        Ok(())
    }

    fn fail(
        &mut self,
        phase: Phase,
        started_at: DateTime<Utc>,
        message: String,
        duration_ms: f64,
    ) -> Result<(), PhaseFailure> {
        self.records.push(PhaseRecord {
            phase,
            severity: phase.severity(),
            outcome: PhaseOutcome::Failed(message.clone()),
            started_at,
            duration_ms,
        });

        match phase.severity() {
            Severity::Fatal => {
                error!("{} failed: {}", phase, message);
                Err(PhaseFailure { phase, message })
            }
            Severity::Soft => {
                warn!("{} failed, continuing: {}", phase, message);
                Ok(())
            }
        }
    }

    /// Mark the run finished
    pub fn finish(&mut self) {
        self.state = RunState::Terminal;
    }
}

impl Default for PhaseDriver {
    fn default() -> Self {
        Self::new()
    }
}
