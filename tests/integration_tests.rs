//! Integration tests for multi-node cadence-lite clusters.
//!
//! These tests verify scheduling, dispatch, concurrency policies and
//! dependents end to end, with every node running its HTTP server.


use chrono::Utc;
use std::time::Duration;
use test_harness::{assert_eventually, manual_job, TestCluster};

use cadence_lite::dispatcher::DispatchResult;
use cadence_lite::error::CadenceError;
use cadence_lite::scheduler::{
    ConcurrencyPolicy, DependentTrigger, ExecutionStatus, Job, JobAction, SchedulerState,
};

/// Test 1: Three-node cluster has exactly one leader and one active scheduler
#[tokio::test]
async fn test_three_node_cluster_has_single_active_scheduler() {
    let mut cluster = TestCluster::new(3, 47100).await;

    assert!(
        cluster.wait_for_convergence(Duration::from_secs(5)).await,
        "Membership should converge"
    );
    assert_eq!(cluster.count_leaders(), 1, "Exactly one leader should exist");
    assert_eq!(cluster.leader_name().as_deref(), Some("node-1"));

    assert_eventually(
        || async {
            cluster.nodes.values().all(|n| {
                let expected = if n.is_leader() {
                    SchedulerState::Active
                } else {
                    SchedulerState::Idle
                };
                n.scheduler_state() == expected
            })
        },
        Duration::from_secs(2),
        "Only the leader's scheduler should be active",
    )
    .await;

    // Every node agrees on the leader through gossip's leader flag.
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.membership.leader_name().await.as_deref() != Some("node-1") {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(2),
        "All nodes should know the leader",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 2: A scheduled job fires on its own and records success
#[tokio::test]
async fn test_scheduled_job_fires() {
    let mut cluster = TestCluster::new(1, 47110).await;

    let job = Job::new("tick", "@every 1s", JobAction::shell("echo tick"));
    cluster.put_job("node-1", job).await;

    assert_eventually(
        || async { cluster.count_with_status("tick", ExecutionStatus::Succeeded).await >= 2 },
        Duration::from_secs(6),
        "Job should fire at least twice",
    )
    .await;

    let executions = cluster.executions("tick").await;
    let succeeded = executions
        .iter()
        .find(|e| e.status == ExecutionStatus::Succeeded)
        .unwrap();
    assert_eq!(succeeded.node, "node-1");
    assert_eq!(succeeded.output, "tick\n");
    assert_eq!(succeeded.exit_code, Some(0));
    assert!(succeeded.success);

    let job = cluster.job_store().get_job("tick").await.unwrap().unwrap();
    assert!(job.stats.success_count >= 2);
    assert_eq!(job.stats.error_count, 0);
    assert!(job.stats.last_success.is_some());

    cluster.shutdown().await;
}

/// Test 3: A force-run issued on a follower is forwarded to the leader and
/// runs on every matching node
#[tokio::test]
async fn test_manual_run_from_follower_runs_everywhere() {
    let mut cluster = TestCluster::new(3, 47120).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);

    let job = manual_job("broadcast", "echo hello").with_placement(&[], 0);
    cluster.put_job("node-2", job).await;

    let follower = cluster.follower().expect("a follower exists");
    let result = follower.service.run_job("broadcast", false).await.unwrap();
    let DispatchResult::Dispatched { targets, failed, .. } = result else {
        panic!("expected a dispatched group, got {:?}", result);
    };
    assert_eq!(targets, vec!["node-1", "node-2", "node-3"]);
    assert!(failed.is_empty());

    assert_eventually(
        || async { cluster.count_with_status("broadcast", ExecutionStatus::Succeeded).await == 3 },
        Duration::from_secs(5),
        "All three targets should succeed",
    )
    .await;

    let executions = cluster.executions("broadcast").await;
    let groups: std::collections::HashSet<_> = executions.iter().map(|e| e.group.clone()).collect();
    assert_eq!(groups.len(), 1, "One firing is one group");

    cluster.shutdown().await;
}

/// Test 4: Placement tags restrict targets
#[tokio::test]
async fn test_placement_tags_select_nodes() {
    let configs = vec![
        test_harness::test_node_config("node-1", 47130, &[]),
        test_harness::test_node_config("node-2", 47131, &[47130]).with_tag("role", "backup"),
        test_harness::test_node_config("node-3", 47132, &[47130]),
    ];
    let mut cluster = TestCluster::with_configs(configs, 47130).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);

    let job = manual_job("backup", "echo saved").with_placement(&[("role", "backup")], 0);
    cluster.put_job("node-1", job).await;

    let leader = cluster.leader().unwrap();
    let result = leader.service.run_job("backup", false).await.unwrap();
    assert!(matches!(
        result,
        DispatchResult::Dispatched { ref targets, .. } if targets == &vec!["node-2".to_string()]
    ));

    // Nothing matches: placement fails and no record is written.
    let job = manual_job("gpu", "echo compute").with_placement(&[("gpu", "true")], 1);
    cluster.put_job("node-1", job).await;
    let result = leader.service.run_job("gpu", false).await.unwrap();
    assert!(matches!(result, DispatchResult::PlacementFailed { .. }));
    assert!(cluster.executions("gpu").await.is_empty());

    assert_eventually(
        || async { cluster.count_with_status("backup", ExecutionStatus::Succeeded).await == 1 },
        Duration::from_secs(5),
        "Backup should run on the tagged node",
    )
    .await;
    assert_eq!(cluster.executions("backup").await[0].node, "node-2");

    cluster.shutdown().await;
}

/// Test 5: Forbid skips a firing while the previous one is still running
#[tokio::test]
async fn test_forbid_policy_skips_overlapping_run() {
    let mut cluster = TestCluster::new(1, 47140).await;

    let job = manual_job("backup", "sleep 2").with_concurrency(ConcurrencyPolicy::Forbid);
    cluster.put_job("node-1", job).await;
    let node = cluster.get_node("node-1").unwrap();

    let first = node.service.run_job("backup", false).await.unwrap();
    assert!(matches!(first, DispatchResult::Dispatched { .. }));

    let second = node.service.run_job("backup", false).await.unwrap();
    assert!(
        matches!(second, DispatchResult::Skipped { .. }),
        "Overlapping run should be skipped, got {:?}",
        second
    );
    assert_eq!(cluster.count_with_status("backup", ExecutionStatus::Skipped).await, 1);

    assert_eventually(
        || async { cluster.count_with_status("backup", ExecutionStatus::Succeeded).await == 1 },
        Duration::from_secs(6),
        "First run should complete",
    )
    .await;

    let job = cluster.job_store().get_job("backup").await.unwrap().unwrap();
    assert_eq!(job.stats.skipped_count, 1);
    assert_eq!(job.stats.success_count, 1);
    assert_eq!(job.stats.error_count, 0);

    // Once the first run is over the next one goes through.
    let third = node.service.run_job("backup", false).await.unwrap();
    assert!(matches!(third, DispatchResult::Dispatched { .. }));

    cluster.shutdown().await;
}

/// Test 6: Replace cancels the running group before starting a new one
#[tokio::test]
async fn test_replace_policy_supersedes_running_group() {
    let mut cluster = TestCluster::new(1, 47150).await;

    let job = manual_job("sync", "sleep 30").with_concurrency(ConcurrencyPolicy::Replace);
    cluster.put_job("node-1", job).await;
    let node = cluster.get_node("node-1").unwrap();

    let DispatchResult::Dispatched { group: first, .. } =
        node.service.run_job("sync", false).await.unwrap()
    else {
        panic!("first run should dispatch");
    };
    assert_eventually(
        || async { node.runner.is_running("sync", &first).await },
        Duration::from_secs(3),
        "First run should be executing",
    )
    .await;

    let DispatchResult::Dispatched { group: second, .. } =
        node.service.run_job("sync", false).await.unwrap()
    else {
        panic!("second run should dispatch");
    };
    assert_ne!(first, second);

    assert_eventually(
        || async {
            cluster
                .executions("sync")
                .await
                .iter()
                .any(|e| e.group == first && e.status == ExecutionStatus::Cancelled)
        },
        Duration::from_secs(5),
        "Superseded group should end cancelled",
    )
    .await;

    let executions = cluster.executions("sync").await;
    let current = executions.iter().find(|e| e.group == second).unwrap();
    assert_eq!(current.status, ExecutionStatus::Running);

    let job = cluster.job_store().get_job("sync").await.unwrap().unwrap();
    assert_eq!(job.stats.error_count, 0, "Cancellation is not an error");

    cluster.shutdown().await;
}

/// Test 7: A deleted job never fires again and its history is gone
#[tokio::test]
async fn test_deleted_job_stops_firing() {
    let mut cluster = TestCluster::new(2, 47160).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);

    let job = Job::new("heartbeat", "@every 1s", JobAction::shell("true")).with_placement(&[], 0);
    // Created through a follower: the leader hears about it over RPC.
    cluster.put_job("node-2", job).await;

    assert_eventually(
        || async { !cluster.executions("heartbeat").await.is_empty() },
        Duration::from_secs(5),
        "Job should fire before deletion",
    )
    .await;

    let follower = cluster.get_node("node-2").unwrap();
    follower.service.delete_job("heartbeat").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    for _ in 0..5 {
        let err = follower.service.list_executions("heartbeat").await.unwrap_err();
        assert!(matches!(err, CadenceError::JobNotFound(_)));
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(cluster.executions("heartbeat").await.is_empty());

    cluster.shutdown().await;
}

/// Test 8: Disabling a job stops its timer without losing its history
#[tokio::test]
async fn test_disabled_job_does_not_fire() {
    let mut cluster = TestCluster::new(1, 47170).await;

    let job = Job::new("report", "@every 1s", JobAction::shell("true"));
    cluster.put_job("node-1", job.clone()).await;
    assert_eventually(
        || async { !cluster.executions("report").await.is_empty() },
        Duration::from_secs(5),
        "Job should fire while enabled",
    )
    .await;

    cluster.put_job("node-1", job.disabled()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let before = cluster.executions("report").await.len();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(cluster.executions("report").await.len(), before);

    // Stats survive the update.
    let stored = cluster.job_store().get_job("report").await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert!(stored.stats.success_count >= 1);

    cluster.shutdown().await;
}

/// Test 9: Dependents run after a successful group, not after a failed one
#[tokio::test]
async fn test_dependents_follow_parent_outcome() {
    let mut cluster = TestCluster::new(2, 47180).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);

    cluster.put_job("node-1", manual_job("notify", "echo done")).await;
    cluster.put_job("node-1", manual_job("cleanup", "echo cleaned")).await;
    cluster
        .put_job(
            "node-1",
            manual_job("extract", "echo extracted").with_dependents(&["notify"]),
        )
        .await;
    let mut failing = manual_job("load", "exit 3").with_dependents(&["cleanup"]);
    failing.dependent_trigger = DependentTrigger::AllSucceeded;
    cluster.put_job("node-1", failing).await;

    let leader = cluster.leader().unwrap();
    leader.service.run_job("extract", false).await.unwrap();
    leader.service.run_job("load", false).await.unwrap();

    assert_eventually(
        || async { cluster.count_with_status("notify", ExecutionStatus::Succeeded).await == 1 },
        Duration::from_secs(5),
        "Dependent of a successful job should run",
    )
    .await;
    assert_eventually(
        || async { cluster.count_with_status("load", ExecutionStatus::Failed).await == 1 },
        Duration::from_secs(5),
        "Failing job should fail",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(cluster.executions("cleanup").await.is_empty());

    let failed = &cluster.executions("load").await[0];
    assert_eq!(failed.exit_code, Some(3));
    let load = cluster.job_store().get_job("load").await.unwrap().unwrap();
    assert_eq!(load.stats.error_count, 1);

    cluster.shutdown().await;
}

/// Test 10: A run past its deadline is killed and counted as a timeout
#[tokio::test]
async fn test_deadline_marks_execution_timed_out() {
    let mut cluster = TestCluster::new(1, 47190).await;

    let job = manual_job("slow", "sleep 30").with_timeout(1);
    cluster.put_job("node-1", job).await;
    let started = Utc::now();
    cluster
        .get_node("node-1")
        .unwrap()
        .service
        .run_job("slow", false)
        .await
        .unwrap();

    assert_eventually(
        || async { cluster.count_with_status("slow", ExecutionStatus::TimedOut).await == 1 },
        Duration::from_secs(5),
        "Execution should time out",
    )
    .await;
    let execution = &cluster.executions("slow").await[0];
    let elapsed = execution.finished_at.unwrap() - started;
    assert!(elapsed < chrono::Duration::seconds(5));

    let job = cluster.job_store().get_job("slow").await.unwrap().unwrap();
    assert_eq!(job.stats.timeout_count, 1);
    assert_eq!(job.stats.error_count, 1);

    cluster.shutdown().await;
}

/// Test 11: A target that crashed before gossip noticed is recorded as a
/// dispatch failure and counted as an error
#[tokio::test]
async fn test_unreachable_target_is_dispatch_failed() {
    let configs = vec![
        test_harness::test_node_config("node-1", 47195, &[]),
        test_harness::test_node_config("node-2", 47196, &[47195]),
        test_harness::test_node_config("node-3", 47197, &[47195]).with_tag("role", "worker"),
    ];
    let mut cluster = TestCluster::with_configs(configs, 47195).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);

    let job = manual_job("ping", "true").with_placement(&[("role", "worker")], 1);
    cluster.put_job("node-1", job).await;

    // Well inside the suspect timeout, so the worker is still alive in gossip.
    cluster.crash_node("node-3");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = cluster
        .leader()
        .unwrap()
        .service
        .run_job("ping", false)
        .await
        .unwrap();
    let DispatchResult::Dispatched { targets, failed, .. } = result else {
        panic!("expected a dispatch, got {:?}", result);
    };
    assert_eq!(targets, vec!["node-3"]);
    assert_eq!(failed, vec!["node-3"]);

    let executions = cluster.executions("ping").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::DispatchFailed);
    assert_eq!(executions[0].node, "node-3");
    assert!(!executions[0].success);

    let job = cluster.job_store().get_job("ping").await.unwrap().unwrap();
    assert_eq!(job.stats.error_count, 1);

    cluster.shutdown().await;
}
