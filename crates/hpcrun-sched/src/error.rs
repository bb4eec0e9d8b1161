//! Error handling for job submission and orchestration.
//!
//! Query failures (status, exit code, output path) never show up here: they
//! are absorbed by the adapters and reported as [`JobStatus::Unknown`] or
//! `None`, so a polling loop is never aborted by a flaky scheduler CLI.
//!
//! [`JobStatus::Unknown`]: crate::status::JobStatus::Unknown

use std::time::Duration;

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while building, submitting or waiting on jobs.
#[derive(Error, Debug)]
pub enum SchedError {
    /// A job attribute failed validation at assignment time.
    #[error("Invalid value for {field}: {message}")]
    Validation { field: String, message: String },

    /// An array range could not be parsed or violates `start <= end, step >= 1`.
    #[error("Invalid array range: {0}")]
    InvalidArrayRange(String),

    /// The external submission command failed.
    #[error("{backend} submission failed: {message}")]
    Submission { backend: String, message: String },

    /// The backend lacks a capability the job needs.
    #[error("{backend} does not support {capability}")]
    Unsupported { backend: String, capability: String },

    /// A wait loop exceeded the caller's deadline. The job itself keeps running.
    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    TimeoutExceeded { job_id: String, waited: Duration },

    /// Generic configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No scheduler is registered under this name.
    #[error("Unknown scheduler: {0}")]
    UnknownScheduler(String),

    /// A pipeline already holds a job with this name.
    #[error("Duplicate job name in pipeline: {0}")]
    DuplicateJobName(String),

    /// A pipeline job references a name that has not been added yet.
    #[error("Unknown dependency: {0} (dependencies must be added first)")]
    UnknownDependency(String),

    /// Job dependency cycle detected.
    #[error("Dependency cycle detected in pipeline")]
    DependencyCycle,

    /// An external command could not be spawned.
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    /// An external command did not return in time.
    #[error("Command timed out after {secs}s: {command}")]
    CommandTimeout { command: String, secs: u64 },

    /// The script renderer has no template with this name.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Job not known to the scheduler.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SchedError {
    /// Shorthand for a [`SchedError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SchedError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`SchedError::Unsupported`].
    pub fn unsupported(backend: impl Into<String>, capability: impl Into<String>) -> Self {
        SchedError::Unsupported {
            backend: backend.into(),
            capability: capability.into(),
        }
    }

    /// Whether this error was raised while declaring a job or pipeline,
    /// as opposed to while talking to a scheduler.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SchedError::Validation { .. }
                | SchedError::InvalidArrayRange(_)
                | SchedError::Config(_)
                | SchedError::UnknownScheduler(_)
                | SchedError::DuplicateJobName(_)
                | SchedError::UnknownDependency(_)
                | SchedError::DependencyCycle
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::JobNotFound("12345".to_string());
        assert_eq!(err.to_string(), "Job not found: 12345");

        let err = SchedError::unsupported("sge", "dependency type 'after'");
        assert_eq!(err.to_string(), "sge does not support dependency type 'after'");

        let err = SchedError::DependencyCycle;
        assert_eq!(err.to_string(), "Dependency cycle detected in pipeline");

        let err = SchedError::validation("mem", "expected a size like 16G");
        assert_eq!(err.to_string(), "Invalid value for mem: expected a size like 16G");
    }

    #[test]
    fn test_timeout_is_distinct_from_job_timeout() {
        let err = SchedError::TimeoutExceeded {
            job_id: "42".to_string(),
            waited: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("waiting for job 42"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(SchedError::UnknownDependency("prep".into()).is_configuration());
        assert!(SchedError::UnknownScheduler("lsf".into()).is_configuration());
        assert!(
            !SchedError::Submission {
                backend: "slurm".into(),
                message: "boom".into()
            }
            .is_configuration()
        );
    }
}
