use serde::{Deserialize, Serialize};

/// Lifecycle state of a job as reported by its backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Unknown,
    Submitted,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Deadline,
    Preempted,
    NodeFail,
    OutOfMemory,
    BootFail,
}

impl JobStatus {
    /// Ordering used to keep status updates monotonic.
    pub fn level(self) -> u8 {
        match self {
            JobStatus::Unknown => 0,
            JobStatus::Submitted => 10,
            JobStatus::Pending => 20,
            JobStatus::Running => 30,
            _ => 40,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.level() == 40
    }

    pub fn is_success(self) -> bool {
        self == JobStatus::Completed
    }

    /// Map a backend state string to a status.
    ///
    /// Accepts accounting spellings such as `CANCELLED by 1234` and
    /// `OUT_OF_ME+`; anything unrecognised is `Unknown`.
    pub fn from_backend_state(state: &str) -> Self {
        let head = state
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();
        match head.as_str() {
            "SUBMITTED" => JobStatus::Submitted,
            "PENDING" | "REQUEUED" | "SUSPENDED" | "RESIZING" => JobStatus::Pending,
            "RUNNING" | "COMPLETING" | "CONFIGURING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            "TIMEOUT" => JobStatus::Timeout,
            "DEADLINE" => JobStatus::Deadline,
            "PREEMPTED" => JobStatus::Preempted,
            "NODE_FAIL" => JobStatus::NodeFail,
            "OUT_OF_MEMORY" | "OUT_OF_ME" => JobStatus::OutOfMemory,
            "BOOT_FAIL" => JobStatus::BootFail,
            _ => JobStatus::Unknown,
        }
    }

    /// Move to `new` unless it would lower the level. Returns whether the
    /// status changed.
    pub fn advance(&mut self, new: JobStatus) -> bool {
        if new.level() < self.level() || new == *self {
            return false;
        }
        *self = new;
        true
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Unknown => "UNKNOWN",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Deadline => "DEADLINE",
            JobStatus::Preempted => "PREEMPTED",
            JobStatus::NodeFail => "NODE_FAIL",
            JobStatus::OutOfMemory => "OUT_OF_MEMORY",
            JobStatus::BootFail => "BOOT_FAIL",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(JobStatus::Unknown.level(), 0);
        assert_eq!(JobStatus::Submitted.level(), 10);
        assert_eq!(JobStatus::Pending.level(), 20);
        assert_eq!(JobStatus::Running.level(), 30);
        assert_eq!(JobStatus::OutOfMemory.level(), 40);
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn advance_never_lowers_level() {
        let mut status = JobStatus::Running;
        assert!(!status.advance(JobStatus::Pending));
        assert_eq!(status, JobStatus::Running);
        assert!(status.advance(JobStatus::Completed));
        assert!(!status.advance(JobStatus::Unknown));
        assert_eq!(status, JobStatus::Completed);
    }

    #[test]
    fn parses_accounting_states() {
        assert_eq!(
            JobStatus::from_backend_state("CANCELLED by 4021"),
            JobStatus::Cancelled
        );
        assert_eq!(JobStatus::from_backend_state("OUT_OF_ME+"), JobStatus::OutOfMemory);
        assert_eq!(JobStatus::from_backend_state("COMPLETING"), JobStatus::Running);
        assert_eq!(JobStatus::from_backend_state("garbage"), JobStatus::Unknown);
        assert_eq!(JobStatus::from_backend_state(""), JobStatus::Unknown);
    }

    #[test]
    fn serde_uses_backend_spelling() {
        let s = serde_json::to_string(&JobStatus::NodeFail).unwrap();
        assert_eq!(s, "\"NODE_FAIL\"");
    }
}
