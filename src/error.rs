// src/error.rs
//
// =============================================================================
// KILN: ERROR TAXONOMY
// =============================================================================
//
// Every caller-visible failure is one of these kinds. The launcher and
// server map them onto the responses described in the interface docs:
// BadOption is rejected before a job id is allocated, JobFailed carries
// the per-component tracebacks, Urd errors are distinguished so clients
// can retry (conflict) or prompt (permission).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Per-component failure report for a job: "prepare" / "analysis(3)" /
/// "synthesis" mapped to the captured traceback text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus(pub BTreeMap<String, String>);

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (component, msg) in &self.0 {
            writeln!(f, "  {}:", component)?;
            writeln!(f, "    {}", msg.replace('\n', "\n    "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KilnError {
    /// Pre-submission rejection: unknown key, wrong type, missing
    /// required option, invalid enum value.
    #[error("bad option: {0}")]
    BadOption(String),

    #[error("job {0:?} not found")]
    NoSuchJob(String),

    #[error("dataset {0:?} not found{1}")]
    NoSuchDataset(String, String),

    #[error("workdir {0:?} not found")]
    NoSuchWorkdir(String),

    /// Programmatic misuse of the dataset API. Fatal to the job, not
    /// the server.
    #[error("dataset usage error: {0}")]
    DatasetUsage(String),

    /// Any other dataset problem (unsupported version, bad column type).
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Iterating with an explicit hashlabel over a dataset whose
    /// declared hashlabel differs, without rehash.
    #[error("{dataset} has hashlabel {actual:?}, not {wanted:?}")]
    HashMismatch {
        dataset: String,
        actual: Option<String>,
        wanted: String,
    },

    #[error("failed to build {job} ({method})")]
    JobFailed {
        job: String,
        method: String,
        status: JobStatus,
    },

    /// Failure to load one or more methods.
    #[error("failed to load {}", .0.join(", "))]
    MethodLoad(Vec<String>),

    /// Job id allocation failed; fatal for the submission.
    #[error("workdir {0} is full")]
    WorkdirFull(String),

    /// Attempting to write an urd entry as a different user.
    #[error("urd: not allowed to write to {0}")]
    UrdPermission(String),

    /// Attempting to overwrite an urd entry with different content
    /// without the update flag.
    #[error("urd: {0} already exists with different content")]
    UrdConflict(String),

    /// I/O and similar failures beneath the server's control.
    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// Formatted multi-line report for a failed build, job id and
    /// failing components included.
    pub fn format_msg(&self) -> String {
        match self {
            KilnError::JobFailed {
                job,
                method,
                status,
            } => format!("{} ({}):\n{}", job, method, status),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_failed_formats_components() {
        let mut status = JobStatus::default();
        status
            .0
            .insert("analysis(2)".into(), "boom\nline two".into());
        let err = KilnError::JobFailed {
            job: "test-0".into(),
            method: "noop".into(),
            status,
        };
        let msg = err.format_msg();
        assert!(msg.starts_with("test-0 (noop):"));
        assert!(msg.contains("  analysis(2):"));
        assert!(msg.contains("    boom\n    line two"));
    }
}
