//! Job definitions and the leader-only scheduling loop.
//!
//! - [`job`]: job model and field validation
//! - [`execution`]: execution records
//! - [`schedule`]: cron and interval expressions
//! - [`timer`]: ordered next-fire structure
//! - [`service`]: the [`Scheduler`] task and its [`SchedulerHandle`]

pub mod execution;
pub mod job;
pub mod schedule;
pub mod service;
pub mod timer;

pub use execution::{new_group_id, Execution, ExecutionStatus};
pub use job::{ConcurrencyPolicy, DependentTrigger, Job, JobAction, JobStats, Placement};
pub use schedule::Schedule;
pub use service::{JobTrigger, Scheduler, SchedulerHandle, SchedulerState};
pub use timer::TimerWheel;
