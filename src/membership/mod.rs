//! Cluster membership and leader election.
//!
//! Membership is an eventually-consistent view maintained by push-pull
//! heartbeat gossip over HTTP. Leadership is not decided here: it is a
//! leased token in the store, and [`LeaderElector`] only mirrors it.
//!
//! # Components
//!
//! - [`Membership`]: member table, failure detector and gossip rounds
//! - [`gossip`]: digest wire types and the HTTP exchange client
//! - [`LeaderElector`]: lease loop over the leadership token
//!
//! # Liveness
//!
//! Each node bumps its own heartbeat every gossip round. A peer whose
//! heartbeat has not advanced for `suspect_timeout` becomes Suspect, after
//! `dead_timeout` Dead, and Dead or Left peers are removed after
//! `reap_timeout`. Heartbeats start at the wall-clock millisecond of process
//! start, so a restarted node always outranks its previous incarnation.

pub mod gossip;
pub mod leader;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GossipConfig;
use crate::error::{CadenceError, Result};

pub use gossip::{GossipClient, GossipMessage, MemberDigest};
pub use leader::LeaderElector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Suspect => write!(f, "suspect"),
            MemberStatus::Dead => write!(f, "dead"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

/// A cluster participant as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// host:port serving the node's HTTP endpoints.
    pub addr: String,
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
    pub leader: bool,
}

impl Node {
    /// Every constraint tag is present with an equal value.
    pub fn matches_tags(&self, constraints: &BTreeMap<String, String>) -> bool {
        constraints
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|tv| tv == v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(Node),
    Update(Node),
    Suspect(Node),
    Dead(Node),
    Leave(Node),
    Reap(Node),
}

#[derive(Debug, Clone)]
struct Member {
    name: String,
    addr: String,
    tags: BTreeMap<String, String>,
    heartbeat: u64,
    status: MemberStatus,
    /// When the heartbeat last advanced.
    last_seen: Instant,
    /// When the status last changed.
    status_since: Instant,
}

impl Member {
    fn to_node(&self, leader: Option<&str>) -> Node {
        Node {
            name: self.name.clone(),
            addr: self.addr.clone(),
            tags: self.tags.clone(),
            status: self.status,
            leader: leader == Some(self.name.as_str()),
        }
    }

    fn to_digest(&self) -> MemberDigest {
        MemberDigest {
            name: self.name.clone(),
            addr: self.addr.clone(),
            tags: self.tags.clone(),
            heartbeat: self.heartbeat,
            left: self.status == MemberStatus::Left,
        }
    }

    fn set_status(&mut self, status: MemberStatus, now: Instant) {
        self.status = status;
        self.status_since = now;
    }
}

/// The member table. Pure state transitions; the caller publishes events.
#[derive(Debug)]
struct MemberTable {
    local: String,
    members: HashMap<String, Member>,
    /// Heartbeat at removal of reaped members. Stale digests still held by
    /// peers must not bring them back.
    tombstones: HashMap<String, (u64, Instant)>,
    leader: Option<String>,
}

impl MemberTable {
    fn new(local: Member) -> Self {
        let name = local.name.clone();
        let mut members = HashMap::new();
        members.insert(name.clone(), local);
        Self {
            local: name,
            members,
            tombstones: HashMap::new(),
            leader: None,
        }
    }

    fn node(&self, member: &Member) -> Node {
        member.to_node(self.leader.as_deref())
    }

    fn bump_local(&mut self) {
        if let Some(local) = self.members.get_mut(&self.local) {
            local.heartbeat += 1;
        }
    }

    fn digest(&self) -> Vec<MemberDigest> {
        self.members.values().map(Member::to_digest).collect()
    }

    /// Merge a peer's digest, keeping the highest heartbeat per node.
    fn merge(&mut self, digests: Vec<MemberDigest>, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        for digest in digests {
            if digest.name == self.local {
                continue;
            }
            let leader = self.leader.clone();
            match self.members.get_mut(&digest.name) {
                None => {
                    // A departure we never saw the node for is not worth tracking.
                    if digest.left {
                        continue;
                    }
                    if let Some((heartbeat, _)) = self.tombstones.get(&digest.name) {
                        if digest.heartbeat <= *heartbeat {
                            continue;
                        }
                        self.tombstones.remove(&digest.name);
                    }
                    let member = Member {
                        name: digest.name.clone(),
                        addr: digest.addr,
                        tags: digest.tags,
                        heartbeat: digest.heartbeat,
                        status: MemberStatus::Alive,
                        last_seen: now,
                        status_since: now,
                    };
                    tracing::info!(node = %member.name, addr = %member.addr, "Member joined");
                    events.push(MembershipEvent::Join(member.to_node(leader.as_deref())));
                    self.members.insert(digest.name, member);
                }
                Some(member) if digest.heartbeat > member.heartbeat => {
                    let changed = member.addr != digest.addr || member.tags != digest.tags;
                    let previous = member.status;
                    member.heartbeat = digest.heartbeat;
                    member.last_seen = now;
                    member.addr = digest.addr;
                    member.tags = digest.tags;

                    if digest.left {
                        if previous != MemberStatus::Left {
                            member.set_status(MemberStatus::Left, now);
                            tracing::info!(node = %member.name, "Member left");
                            events.push(MembershipEvent::Leave(member.to_node(leader.as_deref())));
                        }
                    } else if previous == MemberStatus::Left {
                        member.set_status(MemberStatus::Alive, now);
                        tracing::info!(node = %member.name, "Member rejoined");
                        events.push(MembershipEvent::Join(member.to_node(leader.as_deref())));
                    } else if previous != MemberStatus::Alive {
                        member.set_status(MemberStatus::Alive, now);
                        tracing::info!(node = %member.name, was = %previous, "Member recovered");
                        events.push(MembershipEvent::Update(member.to_node(leader.as_deref())));
                    } else if changed {
                        events.push(MembershipEvent::Update(member.to_node(leader.as_deref())));
                    }
                }
                Some(_) => {}
            }
        }
        events
    }

    /// Advance the failure detector.
    fn detect(&mut self, config: &GossipConfig, now: Instant) -> Vec<MembershipEvent> {
        let suspect_after = Duration::from_millis(config.suspect_timeout_ms);
        let dead_after = Duration::from_millis(config.dead_timeout_ms);
        let reap_after = Duration::from_millis(config.reap_timeout_ms);

        let mut events = Vec::new();
        let mut reaped = Vec::new();
        let leader = self.leader.clone();
        for member in self.members.values_mut() {
            if member.name == self.local {
                continue;
            }
            let silence = now.saturating_duration_since(member.last_seen);
            match member.status {
                MemberStatus::Alive if silence >= suspect_after => {
                    member.set_status(MemberStatus::Suspect, now);
                    tracing::warn!(node = %member.name, silence_ms = silence.as_millis() as u64, "Member suspected");
                    events.push(MembershipEvent::Suspect(member.to_node(leader.as_deref())));
                }
                MemberStatus::Suspect if silence >= dead_after => {
                    member.set_status(MemberStatus::Dead, now);
                    tracing::warn!(node = %member.name, "Member declared dead");
                    events.push(MembershipEvent::Dead(member.to_node(leader.as_deref())));
                }
                MemberStatus::Dead | MemberStatus::Left
                    if now.saturating_duration_since(member.status_since) >= reap_after =>
                {
                    reaped.push(member.name.clone());
                }
                _ => {}
            }
        }
        self.tombstones
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < reap_after);
        for name in reaped {
            if let Some(member) = self.members.remove(&name) {
                tracing::debug!(node = %name, "Member reaped");
                self.tombstones.insert(name.clone(), (member.heartbeat, now));
                events.push(MembershipEvent::Reap(member.to_node(leader.as_deref())));
            }
        }
        events
    }

    fn peers(&self, statuses: &[MemberStatus]) -> Vec<String> {
        self.members
            .values()
            .filter(|m| m.name != self.local && statuses.contains(&m.status))
            .map(|m| m.addr.clone())
            .collect()
    }
}

/// Local view of the cluster.
pub struct Membership {
    local_name: String,
    config: GossipConfig,
    table: RwLock<MemberTable>,
    events: broadcast::Sender<MembershipEvent>,
    client: GossipClient,
    seeds: RwLock<Vec<String>>,
}

impl Membership {
    pub fn new(
        name: &str,
        addr: &str,
        tags: BTreeMap<String, String>,
        config: GossipConfig,
    ) -> Result<Self> {
        let now = Instant::now();
        let local = Member {
            name: name.to_string(),
            addr: addr.to_string(),
            tags,
            heartbeat: Utc::now().timestamp_millis().max(0) as u64,
            status: MemberStatus::Alive,
            last_seen: now,
            status_since: now,
        };
        let client = GossipClient::new(Duration::from_millis(config.request_timeout_ms))?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            local_name: name.to_string(),
            config,
            table: RwLock::new(MemberTable::new(local)),
            events,
            client,
            seeds: RwLock::new(Vec::new()),
        })
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub async fn local_node(&self) -> Node {
        let table = self.table.read().await;
        let local = &table.members[&table.local];
        table.node(local)
    }

    /// All known members, including suspect, dead and departed ones.
    pub async fn members(&self) -> Vec<Node> {
        let table = self.table.read().await;
        let mut nodes: Vec<Node> = table.members.values().map(|m| table.node(m)).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub async fn alive_members(&self) -> Vec<Node> {
        self.members()
            .await
            .into_iter()
            .filter(|n| n.status == MemberStatus::Alive)
            .collect()
    }

    pub async fn member(&self, name: &str) -> Option<Node> {
        let table = self.table.read().await;
        table.members.get(name).map(|m| table.node(m))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Record who holds leadership; only affects the `leader` flag.
    pub async fn set_leader(&self, leader: Option<String>) {
        let mut table = self.table.write().await;
        if table.leader != leader {
            tracing::debug!(leader = ?leader, "Leader view updated");
            table.leader = leader;
        }
    }

    pub async fn leader_name(&self) -> Option<String> {
        self.table.read().await.leader.clone()
    }

    fn publish(&self, events: Vec<MembershipEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    pub async fn message(&self) -> GossipMessage {
        let table = self.table.read().await;
        GossipMessage {
            from: table.local.clone(),
            members: table.digest(),
        }
    }

    /// Server side of an exchange: merge the sender's view and answer with ours.
    pub async fn handle_gossip(&self, incoming: GossipMessage) -> GossipMessage {
        let events = self.table.write().await.merge(incoming.members, Instant::now());
        self.publish(events);
        self.message().await
    }

    /// Merge a digest received out of band.
    pub async fn apply(&self, digests: Vec<MemberDigest>) {
        let events = self.table.write().await.merge(digests, Instant::now());
        self.publish(events);
    }

    async fn exchange(&self, addr: &str) -> Result<()> {
        let outgoing = self.message().await;
        let reply = self.client.exchange(addr, &outgoing).await?;
        self.apply(reply.members).await;
        Ok(())
    }

    /// Contact every seed. Succeeds if at least one answered, or if there
    /// are no seeds (first node of a cluster).
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        *self.seeds.write().await = seeds.to_vec();
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut contacted = 0;
        for seed in seeds {
            match self.exchange(seed).await {
                Ok(()) => contacted += 1,
                Err(e) => tracing::warn!(seed = %seed, error = %e, "Failed to contact seed"),
            }
        }
        if contacted == 0 {
            return Err(CadenceError::Internal(format!(
                "no seed reachable out of {}",
                seeds.len()
            )));
        }
        tracing::info!(contacted, "Joined cluster");
        Ok(contacted)
    }

    /// Mark the local node as departed and tell every live peer.
    pub async fn leave(&self) {
        let peers = {
            let mut table = self.table.write().await;
            let local_name = table.local.clone();
            if let Some(local) = table.members.get_mut(&local_name) {
                local.heartbeat += 1;
                local.set_status(MemberStatus::Left, Instant::now());
            }
            table.peers(&[MemberStatus::Alive, MemberStatus::Suspect])
        };

        for peer in peers {
            if let Err(e) = self.exchange(&peer).await {
                tracing::debug!(peer = %peer, error = %e, "Leave notification failed");
            }
        }
        tracing::info!("Left cluster");
    }

    /// One gossip round: bump, detect, push-pull with random peers.
    pub async fn gossip_round(self: &Arc<Self>) {
        let targets = {
            let mut table = self.table.write().await;
            table.bump_local();
            let events = table.detect(&self.config, Instant::now());
            let mut peers = table.peers(&[MemberStatus::Alive, MemberStatus::Suspect]);
            drop(table);
            self.publish(events);

            if peers.is_empty() {
                peers = self.seeds.read().await.clone();
            }
            peers.shuffle(&mut rand::thread_rng());
            peers.truncate(self.config.fanout.max(1));
            peers
        };

        let mut exchanges = JoinSet::new();
        for peer in targets {
            let membership = self.clone();
            exchanges.spawn(async move {
                if let Err(e) = membership.exchange(&peer).await {
                    tracing::trace!(peer = %peer, error = %e, "Gossip exchange failed");
                }
            });
        }
        while exchanges.join_next().await.is_some() {}
    }

    /// Run gossip rounds until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.gossip_round().await,
            }
        }
        tracing::debug!("Gossip loop stopped");
    }
}
