//! Operations exposed to operators, and their HTTP routes in [`http`].
//!
//! Job mutations go straight to the store from any node; the leader's
//! scheduler is then told to reconcile the job, locally or over
//! `/internal/job-changed`. Force-runs always execute on the leader so the
//! per-job dispatch lock covers them; other nodes forward the request.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{DispatchResult, Dispatcher, Trigger};
use crate::error::{CadenceError, Result};
use crate::membership::{LeaderElector, Membership, Node};
use crate::rpc::AgentTransport;
use crate::scheduler::{Execution, Job, SchedulerHandle, SchedulerState};
use crate::store::{JobStore, LeadershipToken};

/// Summary of the node answering the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub addr: String,
    pub leader: bool,
    pub scheduler: SchedulerState,
    pub members: usize,
    pub version: String,
}

pub struct JobService {
    node_name: String,
    addr: String,
    store: JobStore,
    membership: Arc<Membership>,
    elector: Arc<LeaderElector>,
    dispatcher: Arc<Dispatcher>,
    scheduler: SchedulerHandle,
    transport: Arc<dyn AgentTransport>,
    forward: reqwest::Client,
}

impl JobService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: &str,
        addr: &str,
        store: JobStore,
        membership: Arc<Membership>,
        elector: Arc<LeaderElector>,
        dispatcher: Arc<Dispatcher>,
        scheduler: SchedulerHandle,
        transport: Arc<dyn AgentTransport>,
        forward_timeout: Duration,
    ) -> Result<Self> {
        let forward = reqwest::Client::builder()
            .timeout(forward_timeout)
            .build()
            .map_err(|e| CadenceError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            node_name: node_name.to_string(),
            addr: addr.to_string(),
            store,
            membership,
            elector,
            dispatcher,
            scheduler,
            transport,
            forward,
        })
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.node_name.clone(),
            addr: self.addr.clone(),
            leader: self.elector.is_leader(),
            scheduler: self.scheduler.state(),
            members: self.membership.alive_members().await.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn upsert_job(&self, job: Job) -> Result<Job> {
        let saved = self.store.save_job(job).await?;
        tracing::info!(job = %saved.name, schedule = %saved.schedule, enabled = saved.enabled, "Job saved");
        self.notify_scheduler(&saved.name).await;
        Ok(saved)
    }

    pub async fn get_job(&self, name: &str) -> Result<Job> {
        self.store
            .get_job(name)
            .await?
            .ok_or_else(|| CadenceError::JobNotFound(name.to_string()))
    }

    pub async fn delete_job(&self, name: &str) -> Result<Job> {
        let deleted = self.store.delete_job(name).await?;
        self.notify_scheduler(name).await;
        Ok(deleted)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_jobs().await
    }

    /// Force-run a job now, bypassing its schedule. `forwarded` marks a
    /// request that already hopped once, so a stale leader view cannot
    /// bounce it around.
    pub async fn run_job(&self, name: &str, forwarded: bool) -> Result<DispatchResult> {
        if self.elector.is_leader() {
            tracing::info!(job = %name, "Manual run requested");
            return self.dispatcher.dispatch_named(name, Trigger::Manual).await;
        }
        // Check existence locally so a typo fails fast with 404.
        self.get_job(name).await?;

        let token = self.store.leader_token().await?;
        match token {
            Some(token) if !forwarded && token.holder != self.node_name => {
                self.forward_run(&token, name).await
            }
            Some(token) => Err(CadenceError::NotLeader(Some(token.addr))),
            None => Err(CadenceError::NotLeader(None)),
        }
    }

    async fn forward_run(&self, leader: &LeadershipToken, name: &str) -> Result<DispatchResult> {
        let url = format!("http://{}/v1/jobs/{}?forwarded=true", leader.addr, name);
        tracing::debug!(job = %name, leader = %leader.holder, "Forwarding manual run to leader");

        let response = self
            .forward
            .post(&url)
            .send()
            .await
            .map_err(|_| CadenceError::NotLeader(Some(leader.addr.clone())))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CadenceError::JobNotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(CadenceError::NotLeader(Some(leader.addr.clone())));
        }
        response
            .json::<DispatchResult>()
            .await
            .map_err(|e| CadenceError::Internal(format!("invalid reply from leader: {}", e)))
    }

    pub async fn list_executions(&self, name: &str) -> Result<Vec<Execution>> {
        let executions = self.store.list_executions(name).await?;
        if executions.is_empty() && self.store.get_job(name).await?.is_none() {
            return Err(CadenceError::JobNotFound(name.to_string()));
        }
        Ok(executions)
    }

    pub async fn members(&self) -> Vec<Node> {
        self.membership.members().await
    }

    pub async fn leader(&self) -> Result<Option<LeadershipToken>> {
        self.elector.current_leader().await
    }

    /// Tell the active scheduler to reconcile `name`. Missed notifications
    /// are covered by the scheduler's periodic resync.
    async fn notify_scheduler(&self, name: &str) {
        if self.elector.is_leader() {
            self.scheduler.job_changed(name);
            return;
        }
        match self.store.leader_token().await {
            Ok(Some(token)) if token.holder != self.node_name => {
                if let Err(e) = self.transport.job_changed(&token.addr, name).await {
                    tracing::warn!(job = %name, leader = %token.holder, error = %e, "Failed to notify leader of job change");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "Cannot look up leader to notify of job change");
            }
        }
    }
}
