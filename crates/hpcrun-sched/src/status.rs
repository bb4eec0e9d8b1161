//! Unified job status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend-neutral status of a job.
///
/// Every adapter maps its own raw state vocabulary onto this enum through a
/// fixed table. `Unknown` means "cannot determine right now" and is never
/// treated as final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, held or otherwise waiting to start.
    Pending,
    /// Executing.
    Running,
    /// Finished with exit code 0.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Removed by a user or by dependency enforcement.
    Cancelled,
    /// Killed by the scheduler for exceeding its wall-clock limit.
    Timeout,
    /// The state could not be determined.
    Unknown,
}

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// Check if this represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    /// Check if the job has not reached a terminal state yet.
    ///
    /// `Unknown` counts as active.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Upper-case name, as printed by the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Look up a raw backend state in a fixed mapping table.
///
/// Matching is case-sensitive because some vocabularies (SGE) distinguish
/// `s` from `S`. Unmapped states fall back to [`JobStatus::Unknown`].
pub(crate) fn lookup_state(table: &[(&str, JobStatus)], raw: &str) -> JobStatus {
    let raw = raw.trim();
    table
        .iter()
        .find(|(state, _)| *state == raw)
        .map(|(_, status)| *status)
        .unwrap_or(JobStatus::Unknown)
}

/// Which output stream of a job to locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn name(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for OutputStream {
    type Err = crate::error::SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" | "out" => Ok(OutputStream::Stdout),
            "stderr" | "err" => Ok(OutputStream::Stderr),
            other => Err(crate::error::SchedError::validation(
                "stream",
                format!("expected stdout or stderr, got '{other}'"),
            )),
        }
    }
}
