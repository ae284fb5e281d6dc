//! Node-to-node calls: dispatch, cancellation, status probes, execution
//! reports and job-change notifications. All of it is JSON over HTTP under
//! `/internal/*`; [`server`] builds the router that serves it.

pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::scheduler::{Execution, JobAction};

/// Start one execution on a target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub job: String,
    pub group: String,
    /// Name of the target node; the execution record is keyed by it.
    pub node: String,
    pub action: JobAction,
    /// 0 is unbounded.
    pub deadline_secs: u64,
    /// Address that wants the terminal report.
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum RunAck {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRef {
    pub job: String,
    pub group: String,
}

/// What a runner knows about an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Running,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: RunnerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Terminal outcome sent by a runner to the dispatching node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution: Execution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChanged {
    pub job: String,
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn run(&self, addr: &str, request: &RunRequest) -> Result<RunAck>;

    /// Best-effort cancellation. Returns whether the runner knew the execution.
    async fn cancel(&self, addr: &str, job: &str, group: &str) -> Result<bool>;

    async fn status(&self, addr: &str, job: &str, group: &str) -> Result<RunnerStatus>;

    async fn report(&self, addr: &str, report: &ExecutionReport) -> Result<()>;

    async fn job_changed(&self, addr: &str, job: &str) -> Result<()>;
}

/// [`AgentTransport`] over `reqwest`. Every call carries the configured
/// timeout; an unreachable or slow node becomes `DispatchTransport`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CadenceError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn post<B, R>(&self, addr: &str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let transport_error = |reason: String| CadenceError::DispatchTransport {
            node: addr.to_string(),
            reason,
        };

        let response = self
            .client
            .post(format!("http://{}{}", addr, path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(transport_error(format!("{}: {}", status, text)));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| transport_error(format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn run(&self, addr: &str, request: &RunRequest) -> Result<RunAck> {
        self.post(addr, "/internal/run", request).await
    }

    async fn cancel(&self, addr: &str, job: &str, group: &str) -> Result<bool> {
        let body = ExecutionRef {
            job: job.to_string(),
            group: group.to_string(),
        };
        let response: CancelResponse = self.post(addr, "/internal/cancel", &body).await?;
        Ok(response.cancelled)
    }

    async fn status(&self, addr: &str, job: &str, group: &str) -> Result<RunnerStatus> {
        let body = ExecutionRef {
            job: job.to_string(),
            group: group.to_string(),
        };
        let response: StatusResponse = self.post(addr, "/internal/status", &body).await?;
        Ok(response.status)
    }

    async fn report(&self, addr: &str, report: &ExecutionReport) -> Result<()> {
        let _: serde_json::Value = self.post(addr, "/internal/report", report).await?;
        Ok(())
    }

    async fn job_changed(&self, addr: &str, job: &str) -> Result<()> {
        let body = JobChanged {
            job: job.to_string(),
        };
        let _: serde_json::Value = self.post(addr, "/internal/job-changed", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ack_wire_format() {
        let json = serde_json::to_string(&RunAck::Rejected {
            reason: "busy".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"ack":"rejected","reason":"busy"}"#);
        let ack: RunAck = serde_json::from_str(r#"{"ack":"accepted"}"#).unwrap();
        assert_eq!(ack, RunAck::Accepted);
    }

    #[test]
    fn run_request_carries_action() {
        let request = RunRequest {
            job: "backup".into(),
            group: "g1".into(),
            node: "worker-1".into(),
            action: JobAction::shell("echo hi"),
            deadline_secs: 30,
            reply_to: Some("127.0.0.1:8946".into()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"]["type"], "shell");
        assert_eq!(json["action"]["command"], "echo hi");
        let back: RunRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
