//! Agent runner, resident on every node.
//!
//! The runner accepts [`RunRequest`]s from the leader's dispatcher, runs the
//! action through [`JobExecutor`] and finishes the execution record the
//! dispatcher created:
//!
//! 1. The dispatcher writes a Running record, then calls `/internal/run`
//! 2. [`Runner::accept`] checks the record exists and spawns the execution
//! 3. On completion the Running record is replaced by the terminal one (CAS)
//! 4. Job statistics are updated and old history pruned
//! 5. The terminal record is reported to `reply_to`
//!
//! A runner restarted mid-execution forgets it; the leader's reaper notices
//! through `/internal/status` and marks the record lost.

pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{RetentionConfig, RunnerConfig};
use crate::error::Result;
use crate::rpc::{AgentTransport, ExecutionReport, RunAck, RunRequest, RunnerStatus};
use crate::scheduler::Execution;
use crate::store::{retry_store, JobStore};

pub use executor::{ExecutionOutcome, JobExecutor, OutputBuffer};

const STORE_ATTEMPTS: usize = 5;

type ExecutionKey = (String, String);

pub struct Runner {
    node_name: String,
    store: JobStore,
    executor: JobExecutor,
    transport: Arc<dyn AgentTransport>,
    config: RunnerConfig,
    retention: RetentionConfig,
    running: Mutex<HashMap<ExecutionKey, CancellationToken>>,
}

impl Runner {
    pub fn new(
        node_name: &str,
        store: JobStore,
        transport: Arc<dyn AgentTransport>,
        config: RunnerConfig,
        retention: RetentionConfig,
    ) -> Result<Self> {
        Ok(Self {
            node_name: node_name.to_string(),
            store,
            executor: JobExecutor::new(config.max_output_bytes)?,
            transport,
            config,
            retention,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Accept or reject a run request. Accepted executions run in their own
    /// task; this returns as soon as the execution is registered.
    pub async fn accept(self: &Arc<Self>, request: RunRequest) -> RunAck {
        if request.node != self.node_name {
            return RunAck::Rejected {
                reason: format!(
                    "request addressed to {}, this is {}",
                    request.node, self.node_name
                ),
            };
        }

        let record = match self
            .store
            .get_execution(&request.job, &request.group, &self.node_name)
            .await
        {
            Ok(Some(record)) if !record.is_terminal() => record,
            Ok(Some(record)) => {
                return RunAck::Rejected {
                    reason: format!("execution already {}", record.status),
                }
            }
            Ok(None) => {
                return RunAck::Rejected {
                    reason: "no execution record".to_string(),
                }
            }
            Err(e) => {
                return RunAck::Rejected {
                    reason: e.to_string(),
                }
            }
        };

        let key = (request.job.clone(), request.group.clone());
        let token = CancellationToken::new();
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&key) {
                return RunAck::Rejected {
                    reason: "execution already running".to_string(),
                };
            }
            running.insert(key.clone(), token.clone());
        }

        tracing::info!(job = %request.job, group = %request.group, "Execution accepted");
        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute(request, record, token).await;
        });
        RunAck::Accepted
    }

    async fn execute(self: Arc<Self>, request: RunRequest, record: Execution, token: CancellationToken) {
        let deadline = (request.deadline_secs > 0).then(|| Duration::from_secs(request.deadline_secs));
        let outcome = self
            .executor
            .execute(&request.action, deadline, token)
            .await;

        let terminal = record.finish(outcome.status, outcome.exit_code, outcome.output);
        let written = self.finish(&terminal).await;

        // Only forget the execution once the store reflects it.
        self.running
            .lock()
            .await
            .remove(&(request.job.clone(), request.group.clone()));

        tracing::info!(
            job = %terminal.job_name,
            group = %terminal.group,
            status = %terminal.status,
            exit_code = ?terminal.exit_code,
            "Execution finished"
        );

        if written {
            if let Some(reply_to) = &request.reply_to {
                let report = ExecutionReport {
                    execution: terminal.clone(),
                };
                if let Err(e) = self.transport.report(reply_to, &report).await {
                    tracing::warn!(job = %terminal.job_name, group = %terminal.group, error = %e, "Failed to report execution");
                }
            }
        }
    }

    /// Persist the terminal record, then statistics and retention. Returns
    /// whether this call terminated the record.
    async fn finish(&self, terminal: &Execution) -> bool {
        match retry_store(STORE_ATTEMPTS, || self.store.finish_execution(terminal)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job = %terminal.job_name, group = %terminal.group, "Execution record gone or already terminal");
                return false;
            }
            Err(e) => {
                tracing::warn!(job = %terminal.job_name, group = %terminal.group, error = %e, "Failed to write execution result");
                return false;
            }
        }

        if let Err(e) = retry_store(STORE_ATTEMPTS, || {
            self.store
                .record_outcome(terminal, self.config.deadline_policy)
        })
        .await
        {
            tracing::warn!(job = %terminal.job_name, error = %e, "Failed to update job statistics");
        }
        if let Err(e) = self
            .store
            .prune_executions(&terminal.job_name, &self.retention)
            .await
        {
            tracing::debug!(job = %terminal.job_name, error = %e, "Failed to prune execution history");
        }
        true
    }

    /// Signal cancellation. Returns whether the execution was known.
    pub async fn cancel(&self, job: &str, group: &str) -> bool {
        let running = self.running.lock().await;
        match running.get(&(job.to_string(), group.to_string())) {
            Some(token) => {
                tracing::info!(job, group, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, job: &str, group: &str) -> bool {
        self.running
            .lock()
            .await
            .contains_key(&(job.to_string(), group.to_string()))
    }

    pub async fn status(&self, job: &str, group: &str) -> RunnerStatus {
        if self.is_running(job, group).await {
            RunnerStatus::Running
        } else {
            RunnerStatus::Unknown
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}
