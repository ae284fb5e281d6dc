//! Turns a firing into executions on target nodes.
//!
//! # Dispatch
//!
//! Under a per-job lock the dispatcher evaluates the concurrency policy
//! against the job's unterminated executions, resolves targets through
//! membership and writes one Running record per target. The remote run
//! calls happen after the lock is released, one task per target. A target
//! that cannot be reached gets its record replaced by `DispatchFailed`.
//!
//! The lock only orders dispatches on this node. Across nodes, a group
//! counts only once its job's dispatch claim has been moved by CAS from the
//! version read before the policy was evaluated. The claim carries the
//! leadership term, and a node whose term is older than the claim's does
//! not dispatch the job at all. A dispatcher that loses the claim deletes
//! the records it wrote.
//!
//! # Completion
//!
//! Runners report terminal records back to the dispatching node. When every
//! target of a group has reported, the group's outcome decides whether the
//! job's dependents run. Reports can be lost, so the reaper also reads the
//! records of every tracked group from the store.
//!
//! # Reaper
//!
//! While leader, a periodic pass marks executions `Lost` when their node is
//! gone, their runner no longer knows them, or they kept running past the
//! cancel grace after being superseded.

pub mod placement;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DeadlinePolicy, DispatchConfig};
use crate::error::{CadenceError, Result};
use crate::membership::{MemberStatus, Membership, Node};
use crate::rpc::{AgentTransport, ExecutionReport, RunAck, RunRequest, RunnerStatus};
use crate::scheduler::{
    new_group_id, ConcurrencyPolicy, DependentTrigger, Execution, ExecutionStatus, Job,
    JobTrigger,
};
use crate::store::{retry_store, DispatchClaim, JobStore};

pub use placement::resolve_targets;

const STORE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Dependency { parent: String },
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Dependency { parent } => write!(f, "dependency of {}", parent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchResult {
    /// A group was started. `failed` lists targets that could not be reached.
    Dispatched {
        group: String,
        targets: Vec<String>,
        failed: Vec<String>,
    },
    /// Forbid policy with an unterminated execution.
    Skipped { reason: String },
    PlacementFailed { reason: String },
    /// Not leader, job gone or disabled, or store unreachable.
    Unavailable { reason: String },
}

#[derive(Debug)]
struct GroupTracker {
    expected: HashSet<String>,
    results: HashMap<String, ExecutionStatus>,
    created: Instant,
}

type GroupKey = (String, String);

pub struct Dispatcher {
    node_name: String,
    /// Where runners send their reports.
    addr: String,
    store: JobStore,
    membership: Arc<Membership>,
    transport: Arc<dyn AgentTransport>,
    /// Leadership term, `None` while not leader.
    term_rx: watch::Receiver<Option<u64>>,
    config: DispatchConfig,
    deadline_policy: DeadlinePolicy,
    job_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    groups: Mutex<HashMap<GroupKey, GroupTracker>>,
    superseded: Mutex<HashMap<GroupKey, Instant>>,
    dependents_tx: mpsc::UnboundedSender<(String, String)>,
    dependents_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, String)>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: &str,
        addr: &str,
        store: JobStore,
        membership: Arc<Membership>,
        transport: Arc<dyn AgentTransport>,
        term_rx: watch::Receiver<Option<u64>>,
        config: DispatchConfig,
        deadline_policy: DeadlinePolicy,
    ) -> Self {
        let (dependents_tx, dependents_rx) = mpsc::unbounded_channel();
        Self {
            node_name: node_name.to_string(),
            addr: addr.to_string(),
            store,
            membership,
            transport,
            term_rx,
            config,
            deadline_policy,
            job_locks: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            superseded: Mutex::new(HashMap::new()),
            dependents_tx,
            dependents_rx: Mutex::new(Some(dependents_rx)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.term_rx.borrow().is_some()
    }

    async fn job_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.job_locks
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Look the job up and dispatch it.
    pub async fn dispatch_named(&self, name: &str, trigger: Trigger) -> Result<DispatchResult> {
        let job = self
            .store
            .get_job(name)
            .await?
            .ok_or_else(|| CadenceError::JobNotFound(name.to_string()))?;
        Ok(self.dispatch(job, trigger).await)
    }

    pub async fn dispatch(&self, job: Job, trigger: Trigger) -> DispatchResult {
        let Some(term) = *self.term_rx.borrow() else {
            return DispatchResult::Unavailable {
                reason: "not the leader".to_string(),
            };
        };

        let lock = self.job_lock(&job.name).await;
        let guard = lock.lock().await;

        // The timer may have been armed before the job was deleted or disabled.
        let job = if trigger == Trigger::Manual {
            job
        } else {
            match self.store.get_job(&job.name).await {
                Ok(Some(current)) if current.enabled => current,
                Ok(Some(_)) => {
                    return DispatchResult::Unavailable {
                        reason: format!("job {} is disabled", job.name),
                    }
                }
                Ok(None) => {
                    tracing::debug!(job = %job.name, "Job deleted before firing");
                    return DispatchResult::Unavailable {
                        reason: format!("job {} no longer exists", job.name),
                    };
                }
                Err(e) => return unavailable(&job, e),
            }
        };

        let claimed = match retry_store(STORE_ATTEMPTS, || self.store.dispatch_claim(&job.name)).await {
            Ok(claimed) => claimed,
            Err(e) => return unavailable(&job, e),
        };
        if let Some((_, claim)) = &claimed {
            if claim.term > term {
                tracing::warn!(job = %job.name, term, claim_term = claim.term, "Job claimed under a newer term, not dispatching");
                return DispatchResult::Unavailable {
                    reason: format!("job {} was dispatched under newer term {}", job.name, claim.term),
                };
            }
        }
        let claim_version = claimed.map(|(version, _)| version);

        let running = match retry_store(STORE_ATTEMPTS, || self.store.running_executions(&job.name)).await {
            Ok(running) => running,
            Err(e) => return unavailable(&job, e),
        };

        match job.concurrency {
            ConcurrencyPolicy::Forbid if !running.is_empty() => {
                let reason = format!(
                    "{} execution(s) of the previous run still unterminated",
                    running.len()
                );
                if let Err(e) = self
                    .store
                    .record_skip(&job.name, &new_group_id(), &self.node_name, &reason)
                    .await
                {
                    tracing::warn!(job = %job.name, error = %e, "Failed to record skipped run");
                }
                tracing::info!(job = %job.name, trigger = %trigger, "Run skipped, previous run still active");
                return DispatchResult::Skipped { reason };
            }
            ConcurrencyPolicy::Replace if !running.is_empty() => {
                self.supersede(&running).await;
            }
            _ => {}
        }

        let members = self.membership.members().await;
        let targets = match resolve_targets(&job, &members) {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(job = %job.name, trigger = %trigger, error = %e, "Placement failed");
                return DispatchResult::PlacementFailed {
                    reason: e.to_string(),
                };
            }
        };

        let group = new_group_id();
        let mut records = Vec::new();
        let mut unrecorded = Vec::new();
        for target in &targets {
            let record = Execution::running(&job.name, &group, &target.name);
            match self.store.create_execution(&record).await {
                Ok(_) => records.push((target.clone(), record)),
                Err(e) => {
                    tracing::warn!(job = %job.name, node = %target.name, error = %e, "Failed to create execution record");
                    unrecorded.push((record, e));
                }
            }
        }
        if records.is_empty() {
            return DispatchResult::Unavailable {
                reason: "could not create any execution record".to_string(),
            };
        }

        // A delete that slipped in after the re-read must not leave records behind.
        if !matches!(self.store.get_job(&job.name).await, Ok(Some(_))) {
            self.discard(&records).await;
            return DispatchResult::Unavailable {
                reason: format!("job {} was deleted during dispatch", job.name),
            };
        }

        let claim = DispatchClaim {
            term,
            group: group.clone(),
        };
        match self.store.claim_dispatch(&job.name, claim_version, &claim).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job = %job.name, group = %group, term, "Job was dispatched concurrently, discarding group");
                self.discard(&records).await;
                return DispatchResult::Unavailable {
                    reason: format!("job {} was dispatched concurrently", job.name),
                };
            }
            Err(e) => {
                self.discard(&records).await;
                return unavailable(&job, e);
            }
        }

        let mut failed = Vec::new();
        let mut results = HashMap::new();
        for (record, error) in unrecorded {
            let terminal = record.finish(
                ExecutionStatus::DispatchFailed,
                None,
                format!("could not create execution record: {}", error),
            );
            failed.push(terminal.node.clone());
            results.insert(terminal.node.clone(), terminal.status);
            self.record_dispatch_failure(&terminal).await;
        }

        let mut expected: HashSet<String> = records.iter().map(|(t, _)| t.name.clone()).collect();
        expected.extend(results.keys().cloned());
        self.groups.lock().await.insert(
            (job.name.clone(), group.clone()),
            GroupTracker {
                expected,
                results,
                created: Instant::now(),
            },
        );
        drop(guard);

        tracing::info!(
            job = %job.name,
            group = %group,
            trigger = %trigger,
            targets = ?targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Dispatching"
        );

        let mut calls = JoinSet::new();
        for (target, record) in records {
            let request = RunRequest {
                job: job.name.clone(),
                group: group.clone(),
                node: target.name.clone(),
                action: job.action.clone(),
                deadline_secs: job.timeout_secs,
                reply_to: Some(self.addr.clone()),
            };
            let transport = self.transport.clone();
            let timeout = self.config.timeout();
            calls.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, transport.run(&target.addr, &request)).await {
                    Ok(Ok(RunAck::Accepted)) => Ok(()),
                    Ok(Ok(RunAck::Rejected { reason })) => Err(format!("rejected: {}", reason)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no answer within {}ms", timeout.as_millis())),
                };
                (target, record, outcome)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let Ok((target, record, outcome)) = joined else {
                continue;
            };
            if let Err(reason) = outcome {
                tracing::warn!(job = %job.name, group = %group, node = %target.name, reason = %reason, "Dispatch failed");
                failed.push(target.name.clone());
                let terminal = record.finish(ExecutionStatus::DispatchFailed, None, reason);
                self.terminate(&terminal).await;
            }
        }

        failed.sort();
        DispatchResult::Dispatched {
            group,
            targets: targets.into_iter().map(|t| t.name).collect(),
            failed,
        }
    }

    async fn discard(&self, records: &[(Node, Execution)]) {
        for (_, record) in records {
            if let Err(e) = self.store.delete_execution(record).await {
                tracing::warn!(job = %record.job_name, group = %record.group, error = %e, "Failed to remove discarded execution");
            }
        }
    }

    /// Best effort: the store just refused a write for this target.
    async fn record_dispatch_failure(&self, terminal: &Execution) {
        if let Err(e) = self.store.create_execution(terminal).await {
            tracing::warn!(job = %terminal.job_name, node = %terminal.node, error = %e, "Failed to record dispatch failure");
            return;
        }
        if let Err(e) = self.store.record_outcome(terminal, self.deadline_policy).await {
            tracing::warn!(job = %terminal.job_name, error = %e, "Failed to update job statistics");
        }
    }

    /// Cancel every group in `running`. Groups that do not stop within the
    /// cancel grace are marked lost by the reaper.
    async fn supersede(&self, running: &[Execution]) {
        let now = Instant::now();
        {
            let mut superseded = self.superseded.lock().await;
            for execution in running {
                superseded
                    .entry((execution.job_name.clone(), execution.group.clone()))
                    .or_insert(now);
            }
        }

        for execution in running {
            let Some(node) = self.membership.member(&execution.node).await else {
                continue;
            };
            let transport = self.transport.clone();
            let execution = execution.clone();
            tokio::spawn(async move {
                match transport.cancel(&node.addr, &execution.job_name, &execution.group).await {
                    Ok(known) => {
                        tracing::info!(job = %execution.job_name, group = %execution.group, node = %node.name, known, "Cancellation sent");
                    }
                    Err(e) => {
                        tracing::warn!(job = %execution.job_name, group = %execution.group, node = %node.name, error = %e, "Cancellation failed");
                    }
                }
            });
        }
    }

    /// Write a terminal record produced on this node and account for it.
    async fn terminate(&self, terminal: &Execution) {
        match retry_store(STORE_ATTEMPTS, || self.store.finish_execution(terminal)).await {
            Ok(true) => {
                if let Err(e) = self.store.record_outcome(terminal, self.deadline_policy).await {
                    tracing::warn!(job = %terminal.job_name, error = %e, "Failed to update job statistics");
                }
                self.on_result(terminal).await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job = %terminal.job_name, group = %terminal.group, error = %e, "Failed to terminate execution");
            }
        }
    }

    /// A runner's terminal report.
    pub async fn handle_report(&self, report: ExecutionReport) {
        let execution = report.execution;
        if !execution.is_terminal() {
            return;
        }
        tracing::debug!(job = %execution.job_name, group = %execution.group, node = %execution.node, status = %execution.status, "Execution report received");
        self.on_result(&execution).await;
    }

    async fn on_result(&self, execution: &Execution) {
        let key = (execution.job_name.clone(), execution.group.clone());
        let finished = {
            let mut groups = self.groups.lock().await;
            let Some(tracker) = groups.get_mut(&key) else {
                return;
            };
            if !tracker.expected.contains(&execution.node) {
                return;
            }
            tracker
                .results
                .insert(execution.node.clone(), execution.status);
            if tracker.results.len() < tracker.expected.len() {
                return;
            }
            groups.remove(&key)
        };
        self.superseded.lock().await.remove(&key);

        let Some(tracker) = finished else {
            return;
        };
        let job = match self.store.get_job(&execution.job_name).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(job = %execution.job_name, error = %e, "Cannot load job to trigger dependents");
                return;
            }
        };
        if job.dependents.is_empty() {
            return;
        }

        if group_succeeded(job.dependent_trigger, tracker.results.values()) {
            tracing::info!(job = %job.name, group = %execution.group, dependents = ?job.dependents, "Group succeeded, triggering dependents");
            for dependent in &job.dependents {
                let _ = self.dependents_tx.send((job.name.clone(), dependent.clone()));
            }
        } else {
            tracing::info!(job = %job.name, group = %execution.group, "Group did not succeed, dependents not triggered");
        }
    }

    /// One reaper pass. Returns the number of executions marked lost.
    pub async fn reconcile(&self) -> Result<usize> {
        let running = self.store.all_running_executions().await?;
        let now = Utc::now();
        let lost_grace = chrono::Duration::milliseconds(self.config.lost_grace_ms as i64);
        let cancel_grace = Duration::from_millis(self.config.cancel_grace_ms);

        let still_running: HashSet<GroupKey> = running
            .iter()
            .map(|e| (e.job_name.clone(), e.group.clone()))
            .collect();
        let superseded = {
            let mut superseded = self.superseded.lock().await;
            superseded.retain(|key, _| still_running.contains(key));
            superseded.clone()
        };

        let mut marked = 0;
        for execution in running {
            let key = (execution.job_name.clone(), execution.group.clone());
            let reason = match superseded.get(&key) {
                Some(since) if since.elapsed() >= cancel_grace => {
                    Some("did not stop after being superseded".to_string())
                }
                _ if now - execution.started_at >= lost_grace => self.loss_reason(&execution).await,
                _ => None,
            };

            if let Some(reason) = reason {
                let lost = execution.finish(ExecutionStatus::Lost, None, reason.clone());
                match self.store.finish_execution(&lost).await {
                    Ok(true) => {
                        tracing::warn!(job = %lost.job_name, group = %lost.group, node = %lost.node, reason = %reason, "Execution marked lost");
                        if let Err(e) = self.store.record_outcome(&lost, self.deadline_policy).await {
                            tracing::warn!(job = %lost.job_name, error = %e, "Failed to update job statistics");
                        }
                        self.on_result(&lost).await;
                        marked += 1;
                    }
                    Ok(false) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.sweep_groups().await?;
        Ok(marked)
    }

    /// Settle tracked groups from their stored records, for runners whose
    /// report never arrived. Groups whose records are gone, or that stay
    /// undecided past the expiry, are dropped.
    async fn sweep_groups(&self) -> Result<()> {
        let tracked: Vec<GroupKey> = self.groups.lock().await.keys().cloned().collect();
        for (job, group) in tracked {
            let records = self.store.group_executions(&job, &group).await?;
            if records.is_empty() {
                tracing::debug!(job = %job, group = %group, "Group records gone, no longer tracked");
                self.groups.lock().await.remove(&(job, group));
                continue;
            }
            for record in records.iter().filter(|e| e.is_terminal()) {
                self.on_result(record).await;
            }
        }

        let expiry = self.config.group_expiry();
        self.groups.lock().await.retain(|(job, group), tracker| {
            let keep = tracker.created.elapsed() < expiry;
            if !keep {
                tracing::warn!(job = %job, group = %group, "Group outcome undecided, no longer tracked");
            }
            keep
        });
        Ok(())
    }

    async fn loss_reason(&self, execution: &Execution) -> Option<String> {
        let node = match self.membership.member(&execution.node).await {
            Some(node) if node.status == MemberStatus::Alive => node,
            Some(node) => return Some(format!("node {} is {}", node.name, node.status)),
            None => return Some(format!("node {} is not a member", execution.node)),
        };
        match self
            .transport
            .status(&node.addr, &execution.job_name, &execution.group)
            .await
        {
            Ok(RunnerStatus::Unknown) => Some(format!("runner on {} does not know the execution", node.name)),
            Ok(RunnerStatus::Running) => None,
            // Unreachable but still alive in gossip: wait for the detector.
            Err(_) => None,
        }
    }

    /// Reaper and dependent-trigger loop. Both only act while leader.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut dependents_rx) = self.dependents_rx.lock().await.take() else {
            tracing::error!("Dispatcher loop started twice");
            return;
        };
        let mut reap = tokio::time::interval(Duration::from_millis(self.config.reconcile_interval_ms));
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => {
                    if !self.is_leader() {
                        self.groups.lock().await.clear();
                        self.superseded.lock().await.clear();
                        continue;
                    }
                    match self.reconcile().await {
                        Ok(0) => {}
                        Ok(marked) => tracing::info!(marked, "Reaper marked executions lost"),
                        Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
                    }
                }
                Some((parent, dependent)) = dependents_rx.recv() => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        let trigger = Trigger::Dependency { parent };
                        match dispatcher.dispatch_named(&dependent, trigger).await {
                            Ok(result) => tracing::debug!(job = %dependent, result = ?result, "Dependent dispatched"),
                            Err(e) => tracing::warn!(job = %dependent, error = %e, "Dependent dispatch failed"),
                        }
                    });
                }
            }
        }
        tracing::debug!("Dispatcher loop stopped");
    }
}

#[async_trait]
impl JobTrigger for Dispatcher {
    async fn fire(&self, job: Job, scheduled_at: DateTime<Utc>) {
        let name = job.name.clone();
        let result = self.dispatch(job, Trigger::Scheduled).await;
        tracing::debug!(job = %name, scheduled_at = %scheduled_at, result = ?result, "Scheduled dispatch done");
    }
}

fn unavailable(job: &Job, e: CadenceError) -> DispatchResult {
    tracing::warn!(job = %job.name, error = %e, "Dispatch deferred, store unavailable");
    DispatchResult::Unavailable {
        reason: e.to_string(),
    }
}

fn group_succeeded<'a>(
    policy: DependentTrigger,
    mut statuses: impl Iterator<Item = &'a ExecutionStatus>,
) -> bool {
    match policy {
        DependentTrigger::AllSucceeded => statuses.all(|s| *s == ExecutionStatus::Succeeded),
        DependentTrigger::AnySucceeded => statuses.any(|s| *s == ExecutionStatus::Succeeded),
    }
}
