//! Leader election tests against an in-process store.
//!
//! Electors are ticked by hand under paused time, so lease expiry is exact
//! and no network is involved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_lite::config::{GossipConfig, LeaseConfig};
use cadence_lite::membership::{LeaderElector, MemberDigest, MemberStatus, Membership};
use cadence_lite::store::{JobStore, MemoryStore, Store};

const LEASE: Duration = Duration::from_millis(1_000);

fn elector(name: &str, store: &Arc<MemoryStore>) -> LeaderElector {
    let shared: Arc<dyn Store> = store.clone();
    let addr = format!("{}:8946", name);
    let membership = Arc::new(
        Membership::new(name, &addr, BTreeMap::new(), GossipConfig::default()).unwrap(),
    );
    LeaderElector::new(
        name,
        &addr,
        JobStore::new(shared),
        membership,
        LeaseConfig {
            lease_ms: LEASE.as_millis() as u64,
            renew_interval_ms: 200,
        },
    )
}

fn job_store(store: &Arc<MemoryStore>) -> JobStore {
    let shared: Arc<dyn Store> = store.clone();
    JobStore::new(shared)
}

#[tokio::test(start_paused = true)]
async fn test_first_tick_acquires_leadership() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    let mut watch = a.subscribe();
    let terms = a.subscribe_term();

    assert!(!a.is_leader());
    a.tick().await;
    assert!(a.is_leader());
    assert!(*watch.borrow_and_update());

    let token = job_store(&store).leader_token().await.unwrap().unwrap();
    assert_eq!(token.holder, "a");
    assert_eq!(token.addr, "a:8946");
    assert_eq!(a.term().await, Some(token.term));
    assert_eq!(*terms.borrow(), Some(token.term));
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_holder() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    let b = elector("b", &store);

    a.tick().await;
    b.tick().await;
    assert!(a.is_leader());
    assert!(!b.is_leader());

    // Renewals keep the lease alive well past its TTL.
    for _ in 0..10 {
        tokio::time::advance(Duration::from_millis(200)).await;
        a.tick().await;
        b.tick().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_is_taken_over_with_higher_term() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    let b = elector("b", &store);

    a.tick().await;
    let first_term = a.term().await.unwrap();

    // `a` stops renewing (paused process, lost network).
    tokio::time::advance(LEASE + Duration::from_millis(1)).await;
    b.tick().await;
    assert!(b.is_leader());
    let second_term = b.term().await.unwrap();
    assert!(second_term > first_term);

    // `a` wakes up past its local deadline and steps down without writing.
    a.tick().await;
    assert!(!a.is_leader());
    assert_eq!(a.term().await, None);

    let token = job_store(&store).leader_token().await.unwrap().unwrap();
    assert_eq!(token.holder, "b");
    assert_eq!(token.term, second_term);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_steps_down() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    let mut watch = a.subscribe();

    a.tick().await;
    assert!(*watch.borrow_and_update());

    store.set_offline(true);
    tokio::time::advance(Duration::from_millis(200)).await;
    a.tick().await;
    assert!(!a.is_leader());
    assert!(watch.has_changed().unwrap());
    assert!(!*watch.borrow_and_update());

    // Acquisition fails quietly while the store is down.
    a.tick().await;
    assert!(!a.is_leader());

    store.set_offline(false);
    tokio::time::advance(LEASE).await;
    a.tick().await;
    assert!(a.is_leader());
}

#[tokio::test(start_paused = true)]
async fn test_release_lets_successor_acquire_immediately() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    let b = elector("b", &store);

    a.tick().await;
    let first_term = a.term().await.unwrap();
    a.release().await;
    assert!(!a.is_leader());
    assert!(job_store(&store).leader_token().await.unwrap().is_none());

    b.tick().await;
    assert!(b.is_leader());
    assert!(b.term().await.unwrap() > first_term);

    // Releasing again is a no-op and does not touch b's token.
    a.release().await;
    assert_eq!(
        job_store(&store).leader_token().await.unwrap().unwrap().holder,
        "b"
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_release_does_not_delete_successor_token() {
    let store = Arc::new(MemoryStore::new());
    let jobs = job_store(&store);

    let first = jobs
        .try_acquire_leadership("a", "a:1", LEASE)
        .await
        .unwrap()
        .unwrap();
    tokio::time::advance(LEASE + Duration::from_millis(1)).await;
    let second = jobs
        .try_acquire_leadership("b", "b:1", LEASE)
        .await
        .unwrap()
        .unwrap();

    assert!(!jobs.release_leadership(first.term).await.unwrap());
    assert!(!jobs.renew_leadership(first.term, LEASE).await.unwrap());
    assert_eq!(jobs.leader_token().await.unwrap().unwrap().term, second.term);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_releases_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let a = Arc::new(elector("a", &store));
    let shutdown = tokio_util::sync::CancellationToken::new();

    let handle = tokio::spawn(a.clone().run(shutdown.clone()));
    let mut watch = a.subscribe();
    watch.wait_for(|leader| *leader).await.unwrap();

    shutdown.cancel();
    handle.await.unwrap();
    assert!(!a.is_leader());
    assert!(job_store(&store).leader_token().await.unwrap().is_none());
}

fn digest(name: &str, heartbeat: u64, left: bool) -> MemberDigest {
    MemberDigest {
        name: name.to_string(),
        addr: format!("{}:8946", name),
        tags: BTreeMap::new(),
        heartbeat,
        left,
    }
}

#[tokio::test(start_paused = true)]
async fn test_departed_holder_is_replaced_before_expiry() {
    let store = Arc::new(MemoryStore::new());
    let a = elector("a", &store);
    a.tick().await;
    let old_term = a.term().await.unwrap();

    let shared: Arc<dyn Store> = store.clone();
    let membership = Arc::new(
        Membership::new("b", "b:8946", BTreeMap::new(), GossipConfig::default()).unwrap(),
    );
    let b = LeaderElector::new(
        "b",
        "b:8946",
        JobStore::new(shared),
        membership.clone(),
        LeaseConfig {
            lease_ms: LEASE.as_millis() as u64,
            renew_interval_ms: 200,
        },
    );

    // Alive holder: the lease is respected.
    membership.apply(vec![digest("a", 1, false)]).await;
    b.tick().await;
    assert!(!b.is_leader());

    // Holder announced its departure without releasing.
    membership.apply(vec![digest("a", 2, true)]).await;
    assert_eq!(
        membership.member("a").await.map(|n| n.status),
        Some(MemberStatus::Left)
    );
    b.tick().await;
    assert!(b.is_leader());
    let token = job_store(&store).leader_token().await.unwrap().unwrap();
    assert_eq!(token.holder, "b");
    assert!(token.term > old_term);

    // The old holder's renewal now fails.
    a.tick().await;
    assert!(!a.is_leader());
}
