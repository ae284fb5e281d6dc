use thiserror::Error;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("No eligible targets for job {job}: {reason}")]
    Placement { job: String, reason: String },

    #[error("Dispatch to node {node} failed: {reason}")]
    DispatchTransport { node: String, reason: String },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid schedule '{expr}': {reason}")]
    ScheduleParse { expr: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadenceError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CadenceError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
