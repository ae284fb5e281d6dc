use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::LeaseConfig;
use crate::error::Result;
use crate::membership::{MemberStatus, Membership};
use crate::store::{JobStore, LeadershipToken};

#[derive(Debug, Clone, Copy)]
struct HeldLease {
    term: u64,
    /// Local deadline by which the lease must have been renewed. Measured
    /// from before the renewal request was sent, so it never outlives the
    /// store's own expiry.
    valid_until: Instant,
}

/// Competes for the leadership token and publishes whether this node holds it.
///
/// The token is acquired by CAS on absence, renewed by TTL refresh at its
/// acquisition version, and released by compare-and-delete. Any renewal
/// failure, store error or timeout steps down at once: a node that cannot
/// reach the store must not keep scheduling.
pub struct LeaderElector {
    node_name: String,
    addr: String,
    store: JobStore,
    membership: Arc<Membership>,
    config: LeaseConfig,
    held: Mutex<Option<HeldLease>>,
    leader_tx: watch::Sender<bool>,
    term_tx: watch::Sender<Option<u64>>,
}

impl LeaderElector {
    pub fn new(
        node_name: &str,
        addr: &str,
        store: JobStore,
        membership: Arc<Membership>,
        config: LeaseConfig,
    ) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (term_tx, _) = watch::channel(None);
        Self {
            node_name: node_name.to_string(),
            addr: addr.to_string(),
            store,
            membership,
            config,
            held: Mutex::new(None),
            leader_tx,
            term_tx,
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Leadership changes, latest value first.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    /// Term of the held lease, `None` while not leader. Dispatch tags its
    /// per-job claims with this value.
    pub fn subscribe_term(&self) -> watch::Receiver<Option<u64>> {
        self.term_tx.subscribe()
    }

    /// Term of the lease this node holds, if any.
    pub async fn term(&self) -> Option<u64> {
        self.held.lock().await.map(|h| h.term)
    }

    /// Linearizable read of the token.
    pub async fn current_leader(&self) -> Result<Option<LeadershipToken>> {
        self.store.leader_token().await
    }

    /// Store calls must finish well inside one lease.
    fn store_timeout(&self) -> Duration {
        self.config.renew_interval().min(self.config.lease() / 2)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.release().await;
        tracing::debug!(node = %self.node_name, "Leader election loop stopped");
    }

    /// One acquisition or renewal attempt.
    pub async fn tick(&self) {
        let mut held = self.held.lock().await;
        match *held {
            Some(lease) if Instant::now() >= lease.valid_until => {
                tracing::warn!(node = %self.node_name, term = lease.term, "Lease overdue, stepping down");
                *held = None;
                self.set_leader(None);
            }
            Some(lease) => {
                let sent_at = Instant::now();
                let outcome = timeout(
                    self.store_timeout(),
                    self.store.renew_leadership(lease.term, self.config.lease()),
                )
                .await;
                match outcome {
                    Ok(Ok(true)) => {
                        *held = Some(HeldLease {
                            term: lease.term,
                            valid_until: sent_at + self.config.lease(),
                        });
                        tracing::trace!(node = %self.node_name, term = lease.term, "Lease renewed");
                    }
                    Ok(Ok(false)) => {
                        tracing::warn!(node = %self.node_name, term = lease.term, "Lease lost");
                        *held = None;
                        self.set_leader(None);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(node = %self.node_name, term = lease.term, error = %e, "Lease renewal failed, stepping down");
                        *held = None;
                        self.set_leader(None);
                    }
                    Err(_) => {
                        tracing::warn!(node = %self.node_name, term = lease.term, "Lease renewal timed out, stepping down");
                        *held = None;
                        self.set_leader(None);
                    }
                }
            }
            None => {
                let sent_at = Instant::now();
                let outcome = timeout(
                    self.store_timeout(),
                    self.store
                        .try_acquire_leadership(&self.node_name, &self.addr, self.config.lease()),
                )
                .await;
                match outcome {
                    Ok(Ok(Some(token))) => {
                        *held = Some(HeldLease {
                            term: token.term,
                            valid_until: sent_at + self.config.lease(),
                        });
                        tracing::info!(node = %self.node_name, term = token.term, "Acquired leadership");
                        self.set_leader(Some(token.term));
                    }
                    Ok(Ok(None)) => {
                        if let Some((token, sent_at)) = self.take_over_departed().await {
                            *held = Some(HeldLease {
                                term: token.term,
                                valid_until: sent_at + self.config.lease(),
                            });
                            tracing::info!(node = %self.node_name, term = token.term, "Acquired leadership");
                            self.set_leader(Some(token.term));
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(node = %self.node_name, error = %e, "Leadership acquisition failed");
                    }
                    Err(_) => {
                        tracing::debug!(node = %self.node_name, "Leadership acquisition timed out");
                    }
                }
            }
        }
        drop(held);

        if let Ok(Ok(token)) = timeout(self.store_timeout(), self.store.leader_token()).await {
            self.membership.set_leader(token.map(|t| t.holder)).await;
        }
    }

    /// When gossip has declared the token holder dead or gone, delete its
    /// token at the observed term and compete again instead of waiting out
    /// the lease. A holder that was wrongly declared dead loses its next
    /// renewal.
    async fn take_over_departed(&self) -> Option<(LeadershipToken, Instant)> {
        let token = timeout(self.store_timeout(), self.store.leader_token())
            .await
            .ok()?
            .ok()??;
        if token.holder == self.node_name {
            return None;
        }
        let holder = self.membership.member(&token.holder).await?;
        if !matches!(holder.status, MemberStatus::Dead | MemberStatus::Left) {
            return None;
        }

        let revoked = timeout(self.store_timeout(), self.store.release_leadership(token.term)).await;
        if !matches!(revoked, Ok(Ok(true))) {
            return None;
        }
        tracing::info!(node = %self.node_name, holder = %token.holder, term = token.term, status = %holder.status, "Revoked lease of departed leader");

        let sent_at = Instant::now();
        let acquired = timeout(
            self.store_timeout(),
            self.store
                .try_acquire_leadership(&self.node_name, &self.addr, self.config.lease()),
        )
        .await;
        match acquired {
            Ok(Ok(Some(token))) => Some((token, sent_at)),
            _ => None,
        }
    }

    /// Give up the lease if held. Only our own term is deleted.
    pub async fn release(&self) {
        let mut held = self.held.lock().await;
        let Some(lease) = held.take() else {
            return;
        };
        self.set_leader(None);

        match timeout(self.store_timeout(), self.store.release_leadership(lease.term)).await {
            Ok(Ok(true)) => {
                tracing::info!(node = %self.node_name, term = lease.term, "Released leadership");
            }
            Ok(Ok(false)) => {
                tracing::debug!(node = %self.node_name, term = lease.term, "Lease already gone at release");
            }
            Ok(Err(e)) => {
                tracing::warn!(node = %self.node_name, error = %e, "Failed to release leadership; lease will expire");
            }
            Err(_) => {
                tracing::warn!(node = %self.node_name, "Leadership release timed out; lease will expire");
            }
        }
    }

    fn set_leader(&self, term: Option<u64>) {
        self.term_tx.send_if_modified(|current| {
            if *current == term {
                return false;
            }
            *current = term;
            true
        });
        let leader = term.is_some();
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
    }
}
