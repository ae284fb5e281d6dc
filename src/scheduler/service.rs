use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::job::Job;
use crate::scheduler::schedule::Schedule;
use crate::scheduler::timer::TimerWheel;
use crate::store::{Backoff, JobStore};

/// Receives jobs whose fire time has come. Called from a spawned task, so
/// a slow implementation never holds up the timer loop.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    async fn fire(&self, job: Job, scheduled_at: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Not leader; no timers armed.
    Idle,
    /// Leader; timers armed for every enabled job.
    Active,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug)]
enum SchedulerCommand {
    JobChanged(String),
    Reload,
}

/// Cheap handle for notifying a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    /// Re-evaluate one job after it was created, updated or deleted.
    /// Ignored while Idle.
    pub fn job_changed(&self, name: &str) {
        let _ = self
            .commands
            .send(SchedulerCommand::JobChanged(name.to_string()));
    }

    /// Drop all timers and reload every job from the store.
    pub fn reload(&self) {
        let _ = self.commands.send(SchedulerCommand::Reload);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }
}

struct ScheduledJob {
    job: Job,
    schedule: Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadKind {
    /// Leadership just acquired: catch up on missed windows.
    Activation,
    /// Periodic or requested reload while already Active.
    Resync,
}

/// Leader-only timer loop over every enabled job.
///
/// All timer state lives inside the task and is dropped on step-down; a new
/// leader rebuilds it from the store.
pub struct Scheduler {
    store: JobStore,
    trigger: Arc<dyn JobTrigger>,
    config: SchedulerConfig,
    leader_rx: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    state_tx: watch::Sender<SchedulerState>,
    timers: TimerWheel,
    jobs: HashMap<String, ScheduledJob>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    /// An activation reload failed; its catch-up still has to happen.
    catch_up_pending: bool,
    next_resync: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        store: JobStore,
        trigger: Arc<dyn JobTrigger>,
        config: SchedulerConfig,
        leader_rx: watch::Receiver<bool>,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(config.max_backoff_ms.max(100)),
        );

        let scheduler = Self {
            store,
            trigger,
            config,
            leader_rx,
            commands,
            state_tx,
            timers: TimerWheel::new(),
            jobs: HashMap::new(),
            backoff,
            retry_at: None,
            catch_up_pending: false,
            next_resync: None,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (scheduler, handle)
    }

    fn is_active(&self) -> bool {
        *self.state_tx.borrow() == SchedulerState::Active
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let leader = *self.leader_rx.borrow_and_update();
            if leader && !self.is_active() {
                self.activate().await;
            } else if !leader && self.is_active() {
                self.deactivate();
            }

            let wake_at = self.next_wake();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.leader_rx.changed() => {
                    if changed.is_err() {
                        // Elector gone; nothing can make us leader again.
                        self.deactivate();
                        break;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = sleep_until(wake_at), if wake_at.is_some() => self.on_wake().await,
            }
        }

        if self.is_active() {
            self.deactivate();
        }
        tracing::debug!("Scheduler loop stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        if !self.is_active() {
            return None;
        }
        let timer = self.timers.next_deadline().map(to_instant);
        [timer, self.retry_at, self.next_resync]
            .into_iter()
            .flatten()
            .min()
    }

    async fn activate(&mut self) {
        self.state_tx.send_replace(SchedulerState::Active);
        tracing::info!("Scheduler active");
        self.reload(ReloadKind::Activation).await;
    }

    fn deactivate(&mut self) {
        let armed = self.timers.len();
        self.timers.clear();
        self.jobs.clear();
        self.retry_at = None;
        self.catch_up_pending = false;
        self.next_resync = None;
        self.backoff.reset();
        self.state_tx.send_replace(SchedulerState::Idle);
        tracing::info!(cancelled_timers = armed, "Scheduler idle");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        if !self.is_active() {
            return;
        }
        match command {
            SchedulerCommand::Reload => self.reload(ReloadKind::Resync).await,
            SchedulerCommand::JobChanged(name) => self.reconcile_job(&name).await,
        }
    }

    async fn on_wake(&mut self) {
        let now = Instant::now();
        if self.retry_at.is_some_and(|at| at <= now) || self.next_resync.is_some_and(|at| at <= now) {
            self.reload(ReloadKind::Resync).await;
        }
        self.fire_due();
    }

    /// Rebuild the timer set from the store. On failure the previous timer
    /// set is kept and the reload is retried with backoff.
    async fn reload(&mut self, kind: ReloadKind) {
        let kind = if self.catch_up_pending {
            ReloadKind::Activation
        } else {
            kind
        };
        match self.load_jobs(&kind).await {
            Ok((jobs, timers)) => {
                self.jobs = jobs;
                self.timers = timers;
                self.retry_at = None;
                self.catch_up_pending = false;
                self.backoff.reset();
                self.next_resync =
                    Some(Instant::now() + Duration::from_millis(self.config.resync_interval_ms));
                tracing::debug!(armed = self.timers.len(), "Scheduler reloaded");
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                tracing::warn!(error = %e, retry_ms = delay.as_millis() as u64, "Scheduler reload failed");
                self.retry_at = Some(Instant::now() + delay);
                self.catch_up_pending |= kind == ReloadKind::Activation;
            }
        }
    }

    async fn load_jobs(
        &self,
        kind: &ReloadKind,
    ) -> Result<(HashMap<String, ScheduledJob>, TimerWheel)> {
        let now = Utc::now();
        let mut jobs = HashMap::new();
        let mut timers = TimerWheel::new();

        for job in self.store.list_jobs().await? {
            let Some(scheduled) = prepare(job) else {
                continue;
            };
            let name = scheduled.job.name.clone();

            let catch_up = match kind {
                ReloadKind::Activation => self.missed_window(&scheduled, now).await?,
                // Keep the existing fire time so a resync never skips a tick.
                ReloadKind::Resync => None,
            };
            let fire_at = catch_up
                .or_else(|| match kind {
                    ReloadKind::Resync => self
                        .timers
                        .armed_at(&name)
                        .filter(|_| self.same_schedule(&scheduled)),
                    ReloadKind::Activation => None,
                })
                .or_else(|| scheduled.schedule.next_after(now));

            if let Some(at) = fire_at {
                timers.arm(&name, at);
            }
            jobs.insert(name, scheduled);
        }
        Ok((jobs, timers))
    }

    fn same_schedule(&self, scheduled: &ScheduledJob) -> bool {
        self.jobs
            .get(&scheduled.job.name)
            .is_some_and(|current| current.job.schedule == scheduled.job.schedule)
    }

    /// If fire times passed since the job last fired, fire once now.
    async fn missed_window(
        &self,
        scheduled: &ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let last_execution = self
            .store
            .list_executions(&scheduled.job.name)
            .await?
            .last()
            .map(|e| e.started_at);
        let last_fired = match (scheduled.job.stats.last_run, last_execution) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let Some(last_fired) = last_fired else {
            return Ok(None);
        };

        let missed = scheduled.schedule.missed_between(last_fired, now);
        if missed > 0 {
            tracing::info!(job = %scheduled.job.name, missed, "Catching up on missed fire times once");
            return Ok(Some(now));
        }
        Ok(None)
    }

    /// Single-job reconcile after a mutation.
    async fn reconcile_job(&mut self, name: &str) {
        match self.store.get_job(name).await {
            Ok(Some(job)) => match prepare(job) {
                Some(scheduled) => {
                    let unchanged = self.same_schedule(&scheduled);
                    let fire_at = self
                        .timers
                        .armed_at(name)
                        .filter(|_| unchanged)
                        .or_else(|| scheduled.schedule.next_after(Utc::now()));
                    match fire_at {
                        Some(at) => self.timers.arm(name, at),
                        None => {
                            self.timers.disarm(name);
                        }
                    }
                    tracing::debug!(job = %name, next = ?fire_at, "Job timer reconciled");
                    self.jobs.insert(name.to_string(), scheduled);
                }
                None => {
                    self.timers.disarm(name);
                    self.jobs.remove(name);
                    tracing::debug!(job = %name, "Job timer removed");
                }
            },
            Ok(None) => {
                self.timers.disarm(name);
                self.jobs.remove(name);
                tracing::debug!(job = %name, "Job deleted, timer removed");
            }
            Err(e) => {
                // The periodic resync would catch this too; retry sooner.
                tracing::warn!(job = %name, error = %e, "Job reconcile failed, scheduling reload");
                self.timers.disarm(name);
                self.jobs.remove(name);
                self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            }
        }
    }

    /// Fire every due timer. Each job is re-armed before its trigger runs.
    fn fire_due(&mut self) {
        let now = Utc::now();
        while let Some((scheduled_at, name)) = self.timers.pop_due(now) {
            let Some(entry) = self.jobs.get(&name) else {
                tracing::error!(job = %name, "Timer armed for unknown job, reloading");
                self.timers.clear();
                self.jobs.clear();
                self.retry_at = Some(Instant::now());
                return;
            };

            // Missed ticks collapse into this single fire.
            if let Some(next) = entry.schedule.next_after(now) {
                self.timers.arm(&name, next);
            }

            let job = entry.job.clone();
            let trigger = self.trigger.clone();
            tracing::info!(job = %name, scheduled_at = %scheduled_at, "Job fired");
            tokio::spawn(async move {
                trigger.fire(job, scheduled_at).await;
            });
        }

        if !self.timers.is_consistent() {
            tracing::error!("Timer state corrupted, reloading");
            self.timers.clear();
            self.jobs.clear();
            self.retry_at = Some(Instant::now());
        }
    }
}

/// Parse a stored job; disabled or unparseable jobs get no timer.
fn prepare(job: Job) -> Option<ScheduledJob> {
    if !job.enabled {
        return None;
    }
    match Schedule::parse(&job.schedule) {
        Ok(schedule) => Some(ScheduledJob { job, schedule }),
        Err(e) => {
            tracing::warn!(job = %job.name, error = %e, "Stored job has an invalid schedule");
            None
        }
    }
}

fn to_instant(at: DateTime<Utc>) -> Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delay
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
