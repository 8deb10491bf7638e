use crate::job::JobState;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BatchflowError>;

#[derive(Error, Debug)]
pub enum BatchflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot transition from {from} to {to}")]
    InvalidStateTransition { from: JobState, to: JobState },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Lock not found: {0}")]
    LockNotFound(Uuid),

    #[error("Submit command returned nonzero exit code {code}: {output}")]
    SubmitNonZeroReturnCode { code: i32, output: String },

    #[error("Status command returned nonzero exit code {code}: {output}")]
    StatusNonZeroReturnCode { code: i32, output: String },

    #[error("No queue status information: {0}")]
    NoQStatInformation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BatchflowError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}
