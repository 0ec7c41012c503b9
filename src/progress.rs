use std::fmt;

use crate::job::JobStatus;

/// Stages of a group run, reported in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialization,
    Transfer,
    Submission,
    Running,
    Finalization,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initialization => "initialization",
            Phase::Transfer => "transfer",
            Phase::Submission => "submission",
            Phase::Running => "running",
            Phase::Finalization => "finalization",
        };
        write!(f, "{s}")
    }
}

/// Receives progress notifications. Implementations must not block and
/// cannot influence control flow.
pub trait ProgressObserver: Send + Sync {
    fn on_phase(&self, _group: &str, _phase: Phase) {}

    /// Called after each poll round.
    fn on_poll(&self, _finished: usize, _total: usize, _elapsed_secs: f64) {}

    fn on_status(&self, _job: &str, _status: JobStatus) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Forwards progress to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_phase(&self, group: &str, phase: Phase) {
        tracing::info!(group, phase = %phase, "Group phase");
    }

    fn on_poll(&self, finished: usize, total: usize, elapsed_secs: f64) {
        tracing::info!(finished, total, elapsed_secs, "Waiting for jobs");
    }

    fn on_status(&self, job: &str, status: JobStatus) {
        tracing::debug!(job, status = %status, "Job status changed");
    }
}
