use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DeadlinePolicy, RetentionConfig};
use crate::error::{CadenceError, Result};
use crate::scheduler::execution::{Execution, ExecutionStatus};
use crate::scheduler::job::{Job, JobStats};
use crate::store::{CasOutcome, KvEntry, Store};

const JOBS_PREFIX: &str = "cadence/jobs/";
const EXECUTIONS_PREFIX: &str = "cadence/executions/";
const LEADER_KEY: &str = "cadence/leader";
const DISPATCH_PREFIX: &str = "cadence/dispatch/";
/// Dependency edges of every job, written by CAS so that concurrent saves
/// cannot jointly close a cycle.
const GRAPH_KEY: &str = "cadence/graph";

/// Attempts for optimistic read-modify-write loops before giving up.
const CAS_ATTEMPTS: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct TokenValue {
    holder: String,
    addr: String,
    acquired_at: DateTime<Utc>,
}

/// Current holder of the leadership lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipToken {
    pub holder: String,
    pub addr: String,
    /// Store version of the token write; strictly increases with every
    /// acquisition and stays fixed across renewals.
    pub term: u64,
    pub acquired_at: DateTime<Utc>,
}

impl LeadershipToken {
    fn from_entry(entry: &KvEntry) -> Result<Self> {
        let value: TokenValue = serde_json::from_str(&entry.value)?;
        Ok(Self {
            holder: value.holder,
            addr: value.addr,
            term: entry.version,
            acquired_at: value.acquired_at,
        })
    }
}

/// Latest group dispatched for a job and the leadership term it was
/// dispatched under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchClaim {
    pub term: u64,
    pub group: String,
}

type DependencyGraph = HashMap<String, Vec<String>>;

/// Typed access to jobs, executions and the leadership token.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn Store>,
}

impl JobStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn job_key(name: &str) -> String {
        format!("{}{}", JOBS_PREFIX, name)
    }

    fn executions_prefix(job: &str) -> String {
        format!("{}{}/", EXECUTIONS_PREFIX, job)
    }

    fn dispatch_key(job: &str) -> String {
        format!("{}{}", DISPATCH_PREFIX, job)
    }

    fn execution_key(execution: &Execution) -> String {
        format!(
            "{}{}/{}/{}",
            EXECUTIONS_PREFIX, execution.job_name, execution.group, execution.node
        )
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Validate and upsert a job. Statistics already stored for the job are
    /// kept; statistics supplied by the caller are ignored.
    pub async fn save_job(&self, job: Job) -> Result<Job> {
        job.validate(Utc::now())?;
        self.link_dependents(&job).await?;

        let key = Self::job_key(&job.name);
        for _ in 0..CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let mut next = job.clone();
            let expected = match &current {
                Some(entry) => {
                    let existing: Job = serde_json::from_str(&entry.value)?;
                    next.stats = existing.stats;
                    Some(entry.version)
                }
                None => {
                    next.stats = JobStats::default();
                    None
                }
            };

            let value = serde_json::to_string(&next)?;
            match self.store.compare_and_swap(&key, expected, value, None).await? {
                CasOutcome::Swapped { .. } => {
                    tracing::debug!(job = %next.name, created = current.is_none(), "Job saved");
                    return Ok(next);
                }
                CasOutcome::Mismatch { .. } => continue,
            }
        }
        Err(CadenceError::Conflict(format!(
            "job '{}' is being modified concurrently",
            job.name
        )))
    }

    /// Record `job`'s dependents in the graph key, rejecting the write if
    /// it closes a cycle. The stored graph is acyclic, so any new cycle must
    /// pass through the job being written.
    async fn link_dependents(&self, job: &Job) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut graph, expected) = self.dependency_graph().await?;
            if expected.is_some() && graph.get(&job.name) == Some(&job.dependents) {
                return Ok(());
            }
            graph.insert(job.name.clone(), job.dependents.clone());

            if let Some(path) = find_cycle(&graph, &job.name) {
                return Err(CadenceError::InvalidJob(format!(
                    "dependency cycle: {}",
                    path.join(" -> ")
                )));
            }

            let value = serde_json::to_string(&graph)?;
            match self.store.compare_and_swap(GRAPH_KEY, expected, value, None).await? {
                CasOutcome::Swapped { .. } => return Ok(()),
                CasOutcome::Mismatch { .. } => continue,
            }
        }
        Err(CadenceError::Conflict(format!(
            "dependencies of job '{}' are being modified concurrently",
            job.name
        )))
    }

    async fn unlink_dependents(&self, name: &str) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut graph, expected) = self.dependency_graph().await?;
            if expected.is_some() && !graph.contains_key(name) {
                return Ok(());
            }
            graph.remove(name);

            let value = serde_json::to_string(&graph)?;
            match self.store.compare_and_swap(GRAPH_KEY, expected, value, None).await? {
                CasOutcome::Swapped { .. } => return Ok(()),
                CasOutcome::Mismatch { .. } => continue,
            }
        }
        Err(CadenceError::Conflict(format!(
            "dependencies of job '{}' are being modified concurrently",
            name
        )))
    }

    /// The graph and its version. Stores written before the graph key
    /// existed get it seeded from the job records.
    async fn dependency_graph(&self) -> Result<(DependencyGraph, Option<u64>)> {
        match self.store.get(GRAPH_KEY).await? {
            Some(entry) => Ok((serde_json::from_str(&entry.value)?, Some(entry.version))),
            None => {
                let graph = self
                    .list_jobs()
                    .await?
                    .into_iter()
                    .map(|j| (j.name, j.dependents))
                    .collect();
                Ok((graph, None))
            }
        }
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        match self.store.get(&Self::job_key(name)).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// All jobs ordered by name.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store
            .list(JOBS_PREFIX)
            .await?
            .iter()
            .map(|entry| serde_json::from_str(&entry.value).map_err(CadenceError::from))
            .collect()
    }

    /// Delete a job and its execution history.
    pub async fn delete_job(&self, name: &str) -> Result<Job> {
        let entry = self
            .store
            .delete(&Self::job_key(name))
            .await?
            .ok_or_else(|| CadenceError::JobNotFound(name.to_string()))?;
        let job: Job = serde_json::from_str(&entry.value)?;

        for execution in self.store.list(&Self::executions_prefix(name)).await? {
            self.store.delete(&execution.key).await?;
        }
        self.store.delete(&Self::dispatch_key(name)).await?;
        self.unlink_dependents(name).await?;
        tracing::info!(job = %name, "Job deleted");
        Ok(job)
    }

    /// Apply one execution's outcome to the job's statistics. A job deleted
    /// in the meantime is silently skipped.
    pub async fn record_outcome(&self, execution: &Execution, policy: DeadlinePolicy) -> Result<()> {
        let key = Self::job_key(&execution.job_name);
        for _ in 0..CAS_ATTEMPTS {
            let Some(entry) = self.store.get(&key).await? else {
                return Ok(());
            };
            let mut job: Job = serde_json::from_str(&entry.value)?;
            apply_outcome(&mut job.stats, execution, policy);

            let value = serde_json::to_string(&job)?;
            match self
                .store
                .compare_and_swap(&key, Some(entry.version), value, None)
                .await?
            {
                CasOutcome::Swapped { .. } => return Ok(()),
                CasOutcome::Mismatch { .. } => continue,
            }
        }
        Err(CadenceError::Conflict(format!(
            "statistics for job '{}' are contended",
            execution.job_name
        )))
    }

    // ---------------------------------------------------------------------
    // Executions
    // ---------------------------------------------------------------------

    /// Create a record; fails with `Conflict` if the key already exists.
    pub async fn create_execution(&self, execution: &Execution) -> Result<u64> {
        let key = Self::execution_key(execution);
        let value = serde_json::to_string(execution)?;
        match self.store.compare_and_swap(&key, None, value, None).await? {
            CasOutcome::Swapped { version } => Ok(version),
            CasOutcome::Mismatch { .. } => Err(CadenceError::Conflict(format!(
                "execution {} already exists",
                key
            ))),
        }
    }

    /// Replace a running record with its terminal form. Returns false when
    /// the record is gone or already terminal; terminal records never change.
    pub async fn finish_execution(&self, terminal: &Execution) -> Result<bool> {
        let key = Self::execution_key(terminal);
        let value = serde_json::to_string(terminal)?;
        for _ in 0..CAS_ATTEMPTS {
            let Some(entry) = self.store.get(&key).await? else {
                return Ok(false);
            };
            let current: Execution = serde_json::from_str(&entry.value)?;
            if current.is_terminal() {
                return Ok(false);
            }
            match self
                .store
                .compare_and_swap(&key, Some(entry.version), value.clone(), None)
                .await?
            {
                CasOutcome::Swapped { .. } => return Ok(true),
                CasOutcome::Mismatch { .. } => continue,
            }
        }
        Err(CadenceError::Conflict(format!("execution {} is contended", key)))
    }

    pub async fn delete_execution(&self, execution: &Execution) -> Result<()> {
        self.store.delete(&Self::execution_key(execution)).await?;
        Ok(())
    }

    /// A firing that did not run. Written terminal from the start.
    pub async fn record_skip(&self, job: &str, group: &str, node: &str, reason: &str) -> Result<Execution> {
        let skipped = Execution::running(job, group, node).finish(ExecutionStatus::Skipped, None, reason);
        self.create_execution(&skipped).await?;
        self.record_outcome(&skipped, DeadlinePolicy::default()).await?;
        Ok(skipped)
    }

    pub async fn get_execution(&self, job: &str, group: &str, node: &str) -> Result<Option<Execution>> {
        let key = format!("{}{}/{}/{}", EXECUTIONS_PREFIX, job, group, node);
        match self.store.get(&key).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Executions of one job ordered by start time.
    pub async fn list_executions(&self, job: &str) -> Result<Vec<Execution>> {
        let mut executions = self.decode_executions(&Self::executions_prefix(job)).await?;
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.node.cmp(&b.node)));
        Ok(executions)
    }

    /// Records of one dispatched group.
    pub async fn group_executions(&self, job: &str, group: &str) -> Result<Vec<Execution>> {
        self.decode_executions(&format!("{}{}/", Self::executions_prefix(job), group))
            .await
    }

    pub async fn running_executions(&self, job: &str) -> Result<Vec<Execution>> {
        Ok(self
            .list_executions(job)
            .await?
            .into_iter()
            .filter(|e| !e.is_terminal())
            .collect())
    }

    /// Every unterminated execution in the cluster.
    pub async fn all_running_executions(&self) -> Result<Vec<Execution>> {
        Ok(self
            .decode_executions(EXECUTIONS_PREFIX)
            .await?
            .into_iter()
            .filter(|e| !e.is_terminal())
            .collect())
    }

    async fn decode_executions(&self, prefix: &str) -> Result<Vec<Execution>> {
        self.store
            .list(prefix)
            .await?
            .iter()
            .map(|entry| serde_json::from_str(&entry.value).map_err(CadenceError::from))
            .collect()
    }

    /// Drop terminal records beyond the retention bounds. Running records
    /// are never pruned. Returns the number removed.
    pub async fn prune_executions(&self, job: &str, retention: &RetentionConfig) -> Result<usize> {
        let mut terminal: Vec<(KvEntry, Execution)> = Vec::new();
        for entry in self.store.list(&Self::executions_prefix(job)).await? {
            let execution: Execution = serde_json::from_str(&entry.value)?;
            if execution.is_terminal() {
                terminal.push((entry, execution));
            }
        }
        // Newest first.
        terminal.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

        let now = Utc::now();
        let mut removed = 0;
        for (index, (entry, execution)) in terminal.iter().enumerate() {
            let over_count = retention.max_executions.is_some_and(|max| index >= max);
            let too_old = retention.max_age_secs.is_some_and(|max_age| {
                let finished = execution.finished_at.unwrap_or(execution.started_at);
                (now - finished).num_seconds() > max_age as i64
            });
            if (over_count || too_old) && self.store.compare_and_delete(&entry.key, entry.version).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(job, removed, "Pruned execution history");
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Dispatch claims
    // ---------------------------------------------------------------------

    /// The job's current claim with its version.
    pub async fn dispatch_claim(&self, job: &str) -> Result<Option<(u64, DispatchClaim)>> {
        match self.store.get(&Self::dispatch_key(job)).await? {
            Some(entry) => Ok(Some((entry.version, serde_json::from_str(&entry.value)?))),
            None => Ok(None),
        }
    }

    /// Replace the claim if it is still at `expected`. False when another
    /// dispatch claimed the job in between.
    pub async fn claim_dispatch(
        &self,
        job: &str,
        expected: Option<u64>,
        claim: &DispatchClaim,
    ) -> Result<bool> {
        let value = serde_json::to_string(claim)?;
        match self
            .store
            .compare_and_swap(&Self::dispatch_key(job), expected, value, None)
            .await?
        {
            CasOutcome::Swapped { .. } => Ok(true),
            CasOutcome::Mismatch { .. } => Ok(false),
        }
    }

    // ---------------------------------------------------------------------
    // Leadership token
    // ---------------------------------------------------------------------

    pub async fn leader_token(&self) -> Result<Option<LeadershipToken>> {
        match self.store.get(LEADER_KEY).await? {
            Some(entry) => Ok(Some(LeadershipToken::from_entry(&entry)?)),
            None => Ok(None),
        }
    }

    /// Claim the token if it is absent or expired. Returns the new token on
    /// success and `None` when someone else holds it.
    pub async fn try_acquire_leadership(
        &self,
        holder: &str,
        addr: &str,
        lease: Duration,
    ) -> Result<Option<LeadershipToken>> {
        let value = TokenValue {
            holder: holder.to_string(),
            addr: addr.to_string(),
            acquired_at: Utc::now(),
        };
        let raw = serde_json::to_string(&value)?;
        match self
            .store
            .compare_and_swap(LEADER_KEY, None, raw, Some(lease))
            .await?
        {
            CasOutcome::Swapped { version } => Ok(Some(LeadershipToken {
                holder: value.holder,
                addr: value.addr,
                term: version,
                acquired_at: value.acquired_at,
            })),
            CasOutcome::Mismatch { .. } => Ok(None),
        }
    }

    pub async fn renew_leadership(&self, term: u64, lease: Duration) -> Result<bool> {
        self.store.refresh(LEADER_KEY, term, lease).await
    }

    pub async fn release_leadership(&self, term: u64) -> Result<bool> {
        self.store.compare_and_delete(LEADER_KEY, term).await
    }
}

fn apply_outcome(stats: &mut JobStats, execution: &Execution, policy: DeadlinePolicy) {
    let finished = execution.finished_at.unwrap_or(execution.started_at);
    match execution.status {
        ExecutionStatus::Running => return,
        ExecutionStatus::Skipped => {
            stats.skipped_count += 1;
            return;
        }
        ExecutionStatus::Succeeded => {
            stats.success_count += 1;
            stats.last_success = Some(finished);
        }
        ExecutionStatus::TimedOut => {
            stats.timeout_count += 1;
            if policy == DeadlinePolicy::CountAsError {
                stats.error_count += 1;
                stats.last_error = Some(finished);
            }
        }
        ExecutionStatus::Failed | ExecutionStatus::Lost | ExecutionStatus::DispatchFailed => {
            stats.error_count += 1;
            stats.last_error = Some(finished);
        }
        ExecutionStatus::Cancelled => {}
    }
    if stats.last_run.map_or(true, |last| last < execution.started_at) {
        stats.last_run = Some(execution.started_at);
    }
}

/// Depth-first search for a path from `start` back to itself.
fn find_cycle(graph: &HashMap<String, Vec<String>>, start: &str) -> Option<Vec<String>> {
    fn visit(
        graph: &HashMap<String, Vec<String>>,
        node: &str,
        start: &str,
        path: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) -> bool {
        for next in graph.get(node).map(Vec::as_slice).unwrap_or_default() {
            if next == start {
                path.push(next.clone());
                return true;
            }
            if seen.insert(next.clone()) {
                path.push(next.clone());
                if visit(graph, next, start, path, seen) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![start.to_string()];
    let mut seen = HashSet::new();
    visit(graph, start, start, &mut path, &mut seen).then_some(path)
}
