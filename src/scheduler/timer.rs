use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

/// Next-fire times for every armed job in one ordered set.
///
/// Each job has at most one armed entry; re-arming replaces it.
#[derive(Debug, Default)]
pub struct TimerWheel {
    queue: BTreeSet<(DateTime<Utc>, String)>,
    armed: HashMap<String, DateTime<Utc>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, job: &str, at: DateTime<Utc>) {
        if let Some(previous) = self.armed.insert(job.to_string(), at) {
            self.queue.remove(&(previous, job.to_string()));
        }
        self.queue.insert((at, job.to_string()));
    }

    /// Returns the fire time the job was armed for, if any.
    pub fn disarm(&mut self, job: &str) -> Option<DateTime<Utc>> {
        let at = self.armed.remove(job)?;
        self.queue.remove(&(at, job.to_string()));
        Some(at)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    /// Remove and return the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, String)> {
        let (at, _) = self.queue.first()?;
        if *at > now {
            return None;
        }
        let (at, job) = self.queue.pop_first()?;
        self.armed.remove(&job);
        Some((at, job))
    }

    pub fn armed_at(&self, job: &str) -> Option<DateTime<Utc>> {
        self.armed.get(job).copied()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Queue and index describe the same entries.
    pub fn is_consistent(&self) -> bool {
        self.queue.len() == self.armed.len()
            && self
                .queue
                .iter()
                .all(|(at, job)| self.armed.get(job) == Some(at))
    }
}
