use rand::seq::SliceRandom;

use crate::error::{CadenceError, Result};
use crate::membership::{MemberStatus, Node};
use crate::scheduler::Job;

/// Pick the nodes one firing of `job` runs on.
///
/// Only Alive members whose tags satisfy every constraint are eligible.
/// With a replica count of 0, or one at least as large as the eligible set,
/// every eligible node runs the job; otherwise `count` nodes are chosen at
/// random. No eligible node at all is a placement error.
pub fn resolve_targets(job: &Job, members: &[Node]) -> Result<Vec<Node>> {
    let mut eligible: Vec<Node> = members
        .iter()
        .filter(|n| n.status == MemberStatus::Alive && n.matches_tags(&job.placement.tags))
        .cloned()
        .collect();

    if eligible.is_empty() {
        let constraints = job
            .placement
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        return Err(CadenceError::Placement {
            job: job.name.clone(),
            reason: if constraints.is_empty() {
                "no alive members".to_string()
            } else {
                format!("no alive member matches {}", constraints)
            },
        });
    }

    let count = job.placement.count;
    if count != 0 && count < eligible.len() {
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(count);
    }
    eligible.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(eligible)
}
