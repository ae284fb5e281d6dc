use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Dispatched and not yet terminal.
    Running,
    Succeeded,
    /// The job's own command failed.
    Failed,
    /// The command ran past its deadline and was killed.
    TimedOut,
    /// Superseded by a Replace-policy firing.
    Cancelled,
    /// The runner disappeared or forgot the execution.
    Lost,
    /// The job could not be started on the target.
    DispatchFailed,
    /// A Forbid-policy firing that did not run.
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Lost => "lost",
            ExecutionStatus::DispatchFailed => "dispatch_failed",
            ExecutionStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One run attempt of a job on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub job_name: String,
    /// Shared by every target of one firing.
    pub group: String,
    pub node: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub success: bool,
}

impl Execution {
    pub fn running(job_name: &str, group: &str, node: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            group: group.to_string(),
            node: node.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            output: String::new(),
            success: false,
        }
    }

    /// Terminal copy of this record. The finish time never precedes the
    /// start time even if the wall clock stepped backwards.
    pub fn finish(
        &self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        output: impl Into<String>,
    ) -> Self {
        let now = Utc::now().max(self.started_at);
        Self {
            status,
            finished_at: Some(now),
            exit_code,
            output: output.into(),
            success: status == ExecutionStatus::Succeeded,
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Generate a new group id. Ids sort by creation time.
pub fn new_group_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
