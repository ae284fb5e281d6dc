//! HTTP API tests.
//!
//! Requests go through the `/v1` router in-process with `oneshot`, except
//! where forwarding between nodes needs real sockets.


use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use test_harness::{assert_eventually, manual_job, TestCluster};
use tower::ServiceExt;

use cadence_lite::api::http::routes;
use cadence_lite::api::JobService;
use cadence_lite::scheduler::ExecutionStatus;
use std::sync::Arc;

async fn send(
    service: &Arc<JobService>,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = routes(service.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn backup_job() -> Value {
    json!({
        "name": "backup",
        "schedule": "0 0 3 * * *",
        "action": { "type": "shell", "command": "echo backing up" }
    })
}

/// Test 1: Creating a job returns it with defaults filled in
#[tokio::test]
async fn test_create_and_get_job() {
    let mut cluster = TestCluster::new(1, 47500).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();

    let (status, body) = send(&service, Method::POST, "/v1/jobs", Some(backup_job())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "backup");
    assert_eq!(body["enabled"], true);
    assert_eq!(body["concurrency"], "allow");
    assert_eq!(body["placement"]["count"], 1);
    assert_eq!(body["stats"]["success_count"], 0);

    let (status, body) = send(&service, Method::GET, "/v1/jobs/backup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"]["command"], "echo backing up");

    let (status, body) = send(&service, Method::GET, "/v1/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    cluster.shutdown().await;
}

/// Test 2: Invalid jobs are rejected with 422
#[tokio::test]
async fn test_invalid_jobs_are_rejected() {
    let mut cluster = TestCluster::new(1, 47510).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();

    let mut bad_schedule = backup_job();
    bad_schedule["schedule"] = json!("every tuesday-ish");
    let (status, body) = send(&service, Method::POST, "/v1/jobs", Some(bad_schedule)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("every tuesday-ish"));

    let mut bad_name = backup_job();
    bad_name["name"] = json!("no spaces allowed");
    let (status, _) = send(&service, Method::POST, "/v1/jobs", Some(bad_name)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let mut self_dependent = backup_job();
    self_dependent["dependents"] = json!(["backup"]);
    let (status, _) = send(&service, Method::POST, "/v1/jobs", Some(self_dependent)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // Nothing was stored.
    let (_, body) = send(&service, Method::GET, "/v1/jobs", None).await;
    assert!(body.as_array().unwrap().is_empty());

    cluster.shutdown().await;
}

/// Test 3: Updating a job keeps its statistics
#[tokio::test]
async fn test_update_keeps_stats() {
    let mut cluster = TestCluster::new(1, 47520).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();

    send(&service, Method::POST, "/v1/jobs", Some(backup_job())).await;
    let (status, _) = send(&service, Method::POST, "/v1/jobs/backup", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eventually(
        || async { cluster.count_with_status("backup", ExecutionStatus::Succeeded).await == 1 },
        Duration::from_secs(3),
        "Manual run should succeed",
    )
    .await;

    let mut updated = backup_job();
    updated["schedule"] = json!("0 0 4 * * *");
    let (status, body) = send(&service, Method::POST, "/v1/jobs", Some(updated)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["schedule"], "0 0 4 * * *");
    assert_eq!(body["stats"]["success_count"], 1);

    cluster.shutdown().await;
}

/// Test 4: Unknown jobs are 404 on every job route
#[tokio::test]
async fn test_missing_job_is_not_found() {
    let mut cluster = TestCluster::new(1, 47530).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();

    for (method, uri) in [
        (Method::GET, "/v1/jobs/ghost"),
        (Method::DELETE, "/v1/jobs/ghost"),
        (Method::POST, "/v1/jobs/ghost"),
        (Method::GET, "/v1/executions/ghost"),
    ] {
        let (status, body) = send(&service, method.clone(), uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    cluster.shutdown().await;
}

/// Test 5: A manual run reports its group and shows up in the history
#[tokio::test]
async fn test_run_job_and_list_executions() {
    let mut cluster = TestCluster::new(1, 47540).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();
    cluster.put_job("node-1", manual_job("hello", "echo hi")).await;

    let (status, body) = send(&service, Method::POST, "/v1/jobs/hello", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["result"], "dispatched");
    assert_eq!(body["targets"], json!(["node-1"]));
    let group = body["group"].as_str().unwrap().to_string();

    assert_eventually(
        || async { cluster.count_with_status("hello", ExecutionStatus::Succeeded).await == 1 },
        Duration::from_secs(3),
        "Manual run should succeed",
    )
    .await;

    let (status, body) = send(&service, Method::GET, "/v1/executions/hello", None).await;
    assert_eq!(status, StatusCode::OK);
    let executions = body.as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["group"], group.as_str());
    assert_eq!(executions[0]["status"], "succeeded");
    assert_eq!(executions[0]["output"], "hi\n");

    cluster.shutdown().await;
}

/// Test 6: Deleting a job returns it and removes it
#[tokio::test]
async fn test_delete_job() {
    let mut cluster = TestCluster::new(1, 47550).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();
    send(&service, Method::POST, "/v1/jobs", Some(backup_job())).await;

    let (status, body) = send(&service, Method::DELETE, "/v1/jobs/backup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "backup");

    let (status, _) = send(&service, Method::GET, "/v1/jobs/backup", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    cluster.shutdown().await;
}

/// Test 7: Status, members and leader endpoints describe the cluster
#[tokio::test]
async fn test_cluster_endpoints() {
    let mut cluster = TestCluster::new(2, 47560).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);
    let follower = cluster.get_node("node-2").unwrap().service.clone();

    let (status, body) = send(&follower, Method::GET, "/v1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"], "node-2");
    assert_eq!(body["leader"], false);
    assert_eq!(body["scheduler"], "idle");
    assert_eq!(body["members"], 2);

    let (status, body) = send(&follower, Method::GET, "/v1/leader", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["holder"], "node-1");
    assert_eq!(body["addr"], "127.0.0.1:47560");

    let (status, body) = send(&follower, Method::GET, "/v1/members", None).await;
    assert_eq!(status, StatusCode::OK);
    let mut names: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["node-1", "node-2"]);

    cluster.shutdown().await;
}

/// Test 8: A follower forwards manual runs to the leader
#[tokio::test]
async fn test_follower_forwards_run_to_leader() {
    let mut cluster = TestCluster::new(2, 47570).await;
    assert!(cluster.wait_for_convergence(Duration::from_secs(5)).await);
    cluster.put_job("node-2", manual_job("hello", "echo hi")).await;
    let follower = cluster.get_node("node-2").unwrap().service.clone();

    let (status, body) = send(&follower, Method::POST, "/v1/jobs/hello", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["result"], "dispatched");

    // A request that already hopped once is not forwarded again.
    let (status, body) = send(
        &follower,
        Method::POST,
        "/v1/jobs/hello?forwarded=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["leader"], "127.0.0.1:47570");

    cluster.shutdown().await;
}

/// Test 9: Without a leader, the leader endpoint is unavailable
#[tokio::test]
async fn test_leader_endpoint_without_leader() {
    let mut cluster = TestCluster::new(1, 47580).await;
    let service = cluster.get_node("node-1").unwrap().service.clone();

    cluster.store.set_offline(true);
    let (status, _) = send(&service, Method::GET, "/v1/jobs", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    cluster.store.set_offline(false);
    cluster.stop_node("node-1").await;
    let (status, _) = send(&service, Method::GET, "/v1/leader", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
