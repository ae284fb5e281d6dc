use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Where job definitions, executions and the leadership token live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store. Only useful for a single node, or for tests that
    /// share one store between several in-process nodes.
    Embedded,
    /// Store hosted by another node under `/store/*`.
    Remote { url: String },
}

/// How a run that exceeded its deadline is reflected in job statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlinePolicy {
    /// Timeouts count as errors in addition to the timeout counter.
    #[default]
    CountAsError,
    /// Timeouts only increment the timeout counter.
    TrackSeparately,
}

/// Gossip membership timings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// How often the local heartbeat is bumped and pushed to peers.
    pub interval_ms: u64,
    /// Number of random peers contacted per round.
    pub fanout: usize,
    /// Heartbeat silence after which a peer is suspected.
    pub suspect_timeout_ms: u64,
    /// Heartbeat silence after which a peer is declared dead.
    pub dead_timeout_ms: u64,
    /// Time a dead or departed peer stays in the view before removal.
    pub reap_timeout_ms: u64,
    /// Timeout for a single gossip exchange.
    pub request_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            fanout: 3,
            suspect_timeout_ms: 3_000,
            dead_timeout_ms: 10_000,
            reap_timeout_ms: 60_000,
            request_timeout_ms: 1_000,
        }
    }
}

/// Leadership lease timings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease TTL on the leadership token.
    pub lease_ms: u64,
    /// How often the holder renews (and non-holders retry acquisition).
    /// Must be well below `lease_ms`.
    pub renew_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ms: 10_000,
            renew_interval_ms: 2_000,
        }
    }
}

impl LeaseConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Full reload interval while Active, catching mutations whose
    /// notification never reached the leader.
    pub resync_interval_ms: u64,
    /// Upper bound for reload retry backoff.
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: 60_000,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout for one remote run/cancel/status call.
    pub timeout_ms: u64,
    /// Minimum age before a running execution is checked for loss.
    pub lost_grace_ms: u64,
    /// How long a superseded group may keep running after cancellation.
    pub cancel_grace_ms: u64,
    /// Reaper period on the leader.
    pub reconcile_interval_ms: u64,
    /// A dispatched group whose outcome is still undecided after this long
    /// is forgotten, and its dependents never run.
    pub group_expiry_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            lost_grace_ms: 30_000,
            cancel_grace_ms: 30_000,
            reconcile_interval_ms: 10_000,
            group_expiry_ms: 86_400_000,
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn group_expiry(&self) -> Duration {
        Duration::from_millis(self.group_expiry_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Captured output beyond this many bytes is dropped.
    pub max_output_bytes: usize,
    pub deadline_policy: DeadlinePolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            deadline_policy: DeadlinePolicy::default(),
        }
    }
}

/// Per-job execution history bounds. Either bound may be disabled.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub max_executions: Option<usize>,
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_executions: Some(100),
            max_age_secs: Some(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node name in the cluster.
    pub node_name: String,
    pub bind_addr: SocketAddr,
    /// host:port peers use to reach this node. Defaults to `bind_addr`.
    pub advertise_addr: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// host:port of nodes to join on startup.
    pub seeds: Vec<String>,
    pub store: StoreBackend,
    /// Serve the local embedded store to other nodes under `/store/*`.
    pub serve_store: bool,
    pub gossip: GossipConfig,
    pub lease: LeaseConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub runner: RunnerConfig,
    pub retention: RetentionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8946)),
            advertise_addr: None,
            tags: BTreeMap::new(),
            seeds: Vec::new(),
            store: StoreBackend::Embedded,
            serve_store: false,
            gossip: GossipConfig::default(),
            lease: LeaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            runner: RunnerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_seed(mut self, addr: impl Into<String>) -> Self {
        self.seeds.push(addr.into());
        self
    }

    pub fn with_store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    /// Address advertised to peers.
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }
}

/// Parse `key=value` pairs separated by commas.
pub fn parse_tags(input: &str) -> BTreeMap<String, String> {
    input
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Some((k.trim().to_string(), v.trim().to_string()))
            }
            _ => {
                tracing::warn!(pair, "Invalid tag format, expected key=value");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_name, "node-1");
        assert_eq!(cfg.bind_addr.to_string(), "127.0.0.1:8946");
        assert!(cfg.seeds.is_empty());
        assert!(cfg.tags.is_empty());
        assert_eq!(cfg.store, StoreBackend::Embedded);
        assert!(!cfg.serve_store);
    }

    #[test]
    fn lease_renews_well_inside_ttl() {
        let cfg = LeaseConfig::default();
        assert!(cfg.renew_interval() * 2 < cfg.lease());
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new("worker-a", addr)
            .with_tag("role", "worker")
            .with_seed("10.0.0.2:9000")
            .with_store(StoreBackend::Remote {
                url: "http://10.0.0.2:9000".to_string(),
            });
        assert_eq!(cfg.node_name, "worker-a");
        assert_eq!(cfg.tags.get("role").map(String::as_str), Some("worker"));
        assert_eq!(cfg.seeds, vec!["10.0.0.2:9000".to_string()]);
        assert!(matches!(cfg.store, StoreBackend::Remote { .. }));
    }

    #[test]
    fn advertised_falls_back_to_bind_addr() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.advertised(), "127.0.0.1:8946");
        cfg.advertise_addr = Some("node1.internal:8946".to_string());
        assert_eq!(cfg.advertised(), "node1.internal:8946");
    }

    #[test]
    fn parse_tags_skips_malformed_pairs() {
        let tags = parse_tags("role=worker, dc = eu-1,bogus,=x,");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["role"], "worker");
        assert_eq!(tags["dc"], "eu-1");
    }

    #[test]
    fn deadline_policy_defaults_to_error() {
        assert_eq!(DeadlinePolicy::default(), DeadlinePolicy::CountAsError);
        assert_eq!(
            RunnerConfig::default().deadline_policy,
            DeadlinePolicy::CountAsError
        );
    }
}
