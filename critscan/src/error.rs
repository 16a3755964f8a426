use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, ScanStatus};

/// Violations and I/O failures of sandboxed filesystem operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unsafe path {}: {reason}", path.display())]
    UnsafePath { path: PathBuf, reason: String },
    #[error("filesystem operation on {} failed", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SandboxError {
    pub(crate) fn unsafe_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsafePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: ScanStatus,
        to: ScanStatus,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Backend(err.into())
    }
}

/// Everything that can end a scan job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid repository reference {reference:?}: {reason}")]
    InvalidRepositoryReference { reference: String, reason: String },

    #[error("repository acquisition timed out after {}s", timeout.as_secs())]
    AcquisitionTimeout { timeout: Duration },

    #[error("repository acquisition failed: {0:#}")]
    AcquisitionFailed(#[source] anyhow::Error),

    #[error("scanner failed ({}): {detail}", describe_exit(*exit_code, *signal))]
    ScanExecutionFailed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        detail: String,
        output_tail: String,
    },

    #[error("scanner exceeded its {}s ceiling and was terminated", timeout.as_secs())]
    ScanTimeout { timeout: Duration },

    #[error("report {} could not be parsed", path.display())]
    ReportParseFailed {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("unsafe path {}: {reason}", path.display())]
    UnsafePath { path: PathBuf, reason: String },

    #[error("filesystem operation on {} failed", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("job {0} does not exist")]
    JobNotFound(JobId),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRepositoryReference { .. } => "InvalidRepositoryReference",
            Self::AcquisitionTimeout { .. } => "AcquisitionTimeout",
            Self::AcquisitionFailed(_) => "AcquisitionFailed",
            Self::ScanExecutionFailed { .. } => "ScanExecutionFailed",
            Self::ScanTimeout { .. } => "ScanTimeout",
            Self::ReportParseFailed { .. } => "ReportParseFailed",
            Self::UnsafePath { .. } => "UnsafePath",
            Self::Filesystem { .. } => "Filesystem",
            Self::PersistenceFailure(_) => "PersistenceFailure",
            Self::JobNotFound(_) => "JobNotFound",
        }
    }

    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRepositoryReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Text kept on the job record when it fails.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::ScanExecutionFailed { output_tail, .. } if !output_tail.is_empty() => {
                format!("{}: {self}\n{output_tail}", self.kind())
            }
            _ => format!("{}: {self}", self.kind()),
        }
    }
}

impl From<SandboxError> for PipelineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::UnsafePath { path, reason } => Self::UnsafePath { path, reason },
            SandboxError::Io { path, source } => Self::Filesystem { path, source },
        }
    }
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => "no exit status".to_string(),
    }
}
