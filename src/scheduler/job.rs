use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::scheduler::schedule::Schedule;

/// What overlapping firings of one job do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Every firing starts a new group.
    #[default]
    Allow,
    /// Skip the firing while any execution of the job is unterminated.
    Forbid,
    /// Cancel the unterminated group, then start a new one.
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::Allow => write!(f, "allow"),
            ConcurrencyPolicy::Forbid => write!(f, "forbid"),
            ConcurrencyPolicy::Replace => write!(f, "replace"),
        }
    }
}

/// When a finished group counts as successful for triggering dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentTrigger {
    #[default]
    AllSucceeded,
    AnySucceeded,
}

/// The work a job performs. Closed set; each variant has one executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobAction {
    /// Run a process. With no `args`, `command` goes through `sh -c`.
    Shell {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Call an HTTP endpoint; any 2xx response is a success.
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        body: Option<String>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl JobAction {
    pub fn shell(command: impl Into<String>) -> Self {
        JobAction::Shell {
            command: command.into(),
            args: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            JobAction::Shell { command, .. } if command.trim().is_empty() => {
                Err(CadenceError::InvalidJob("command must not be empty".to_string()))
            }
            JobAction::Http { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(CadenceError::InvalidJob(format!("invalid url: {}", url)))
            }
            JobAction::Http { method, .. } if reqwest::Method::from_bytes(method.as_bytes()).is_err() => {
                Err(CadenceError::InvalidJob(format!("invalid method: {}", method)))
            }
            _ => Ok(()),
        }
    }
}

/// Which nodes run the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Every tag must be present on the node with an equal value.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Desired replica count; 0 means every matching node.
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            tags: BTreeMap::new(),
            count: 1,
        }
    }
}

/// Derived counters; written only through the store's CAS loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub success_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub skipped_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub schedule: String,
    pub action: JobAction,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Jobs run immediately after a successful group of this one.
    #[serde(default)]
    pub dependents: Vec<String>,
    #[serde(default)]
    pub dependent_trigger: DependentTrigger,
    /// Execution deadline in seconds; 0 is unbounded.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub stats: JobStats,
}

fn default_enabled() -> bool {
    true
}

impl Job {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, action: JobAction) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            action,
            placement: Placement::default(),
            concurrency: ConcurrencyPolicy::default(),
            enabled: true,
            dependents: Vec::new(),
            dependent_trigger: DependentTrigger::default(),
            timeout_secs: 0,
            stats: JobStats::default(),
        }
    }

    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    pub fn with_placement(mut self, tags: &[(&str, &str)], count: usize) -> Self {
        self.placement = Placement {
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            count,
        };
        self
    }

    pub fn with_dependents(mut self, dependents: &[&str]) -> Self {
        self.dependents = dependents.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Field-level checks that need no other job. Dependency cycles are
    /// checked by the store, which sees every job.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<Schedule> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(CadenceError::InvalidJob(format!(
                "invalid job name '{}': use letters, digits, '-', '_' or '.'",
                self.name
            )));
        }
        if self.dependents.iter().any(|d| d == &self.name) {
            return Err(CadenceError::InvalidJob(format!(
                "job '{}' depends on itself",
                self.name
            )));
        }
        self.action.validate()?;
        Schedule::parse_upcoming(&self.schedule, now)
    }
}
