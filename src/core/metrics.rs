use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::phase::{Phase, PhaseOutcome, RunState, Severity};

/// Timing and outcome of one executed phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub severity: Severity,
    pub outcome: PhaseOutcome,
    /// Wall-clock start of the phase
    pub started_at: DateTime<Utc>,
    /// Phase duration in milliseconds
    pub duration_ms: f64,
}

/// Process exit status of an experiment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    /// A fatal phase failed
    FatalFailure,
    /// A required local file was missing before anything ran
    MissingLocalFile,
}

impl RunStatus {
    pub fn code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::FatalFailure => 1,
            RunStatus::MissingLocalFile => 2,
        }
    }
}

/// Summary of one orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Correlation id for log lines of this run
    pub run_uuid: Uuid,
    pub node: String,
    pub status: RunStatus,
    pub final_state: RunState,
    pub phases: Vec<PhaseRecord>,
    pub allocation_id: Option<String>,
    pub result_folder: Option<PathBuf>,
    pub submission_dir: Option<PathBuf>,
    pub deposition_url: Option<String>,
    /// Failure message of the fatal phase, if any
    pub error: Option<String>,
}

impl RunReport {
    /// Soft phases that failed
    pub fn soft_failures(&self) -> Vec<&PhaseRecord> {
        self.phases
            .iter()
            .filter(|r| r.severity == Severity::Soft && matches!(r.outcome, PhaseOutcome::Failed(_)))
            .collect()
    }

    pub fn total_duration_ms(&self) -> f64 {
        self.phases.iter().map(|r| r.duration_ms).sum()
    }

    /// Slowest phase, if any ran
    pub fn slowest_phase(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms))
    }

    pub fn log_summary(&self) {
        info!(
            "Run {} on {} ended in {:?} after {:.1}s ({} phases, {} soft failures)",
            self.run_uuid,
            self.node,
            self.final_state,
            self.total_duration_ms() / 1000.0,
            self.phases.len(),
            self.soft_failures().len()
        );
        if let Some(slowest) = self.slowest_phase() {
            info!("Slowest phase: {} ({:.1}s)", slowest.phase, slowest.duration_ms / 1000.0);
        }
        if let Some(folder) = &self.result_folder {
            info!("Results at: {}", folder.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phase: Phase, outcome: PhaseOutcome, duration_ms: f64) -> PhaseRecord {
        PhaseRecord {
            phase,
            severity: phase.severity(),
            outcome,
            started_at: Utc::now(),
            duration_ms,
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RunStatus::Success.code(), 0);
        assert_eq!(RunStatus::FatalFailure.code(), 1);
        assert_eq!(RunStatus::MissingLocalFile.code(), 2);
    }

    #[test]
    fn test_report_summaries() {
        let report = RunReport {
            run_uuid: Uuid::new_v4(),
            node: "n1".to_string(),
            status: RunStatus::Success,
            final_state: RunState::Terminal,
            phases: vec![
                record(Phase::Workload, PhaseOutcome::Completed, 1500.0),
                record(Phase::Collect, PhaseOutcome::Failed("renderer".into()), 20.0),
                record(Phase::Publish, PhaseOutcome::Skipped("not requested".into()), 0.0),
            ],
            allocation_id: Some("42".to_string()),
            result_folder: None,
            submission_dir: None,
            deposition_url: None,
            error: None,
        };

        assert_eq!(report.soft_failures().len(), 1);
        assert_eq!(report.total_duration_ms(), 1520.0);
        assert_eq!(report.slowest_phase().map(|r| r.phase), Some(Phase::Workload));
    }
}
