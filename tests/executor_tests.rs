use std::time::{Duration, Instant};

use axum::{http::StatusCode, routing::get, Router};
use tokio_util::sync::CancellationToken;

use cadence_lite::agent::executor::TRUNCATION_MARKER;
use cadence_lite::agent::JobExecutor;
use cadence_lite::scheduler::{ExecutionStatus, JobAction};

fn test_executor() -> JobExecutor {
    JobExecutor::new(64 * 1024).unwrap()
}

async fn run(executor: &JobExecutor, action: JobAction) -> cadence_lite::agent::ExecutionOutcome {
    executor
        .execute(&action, None, CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_execute_simple_command() {
    let outcome = run(&test_executor(), JobAction::shell("echo hello")).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.output, "hello\n");
}

#[tokio::test]
async fn test_execute_empty_output() {
    let outcome = run(&test_executor(), JobAction::shell("true")).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(outcome.output.is_empty());
}

#[tokio::test]
async fn test_execute_nonzero_exit_fails_with_code() {
    let outcome = run(&test_executor(), JobAction::shell("echo oops >&2; exit 3")).await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));
    // stderr is captured alongside stdout
    assert_eq!(outcome.output, "oops\n");
}

#[tokio::test]
async fn test_execute_missing_binary() {
    let action = JobAction::Shell {
        command: "/nonexistent/cadence-test-binary".to_string(),
        args: vec!["x".to_string()],
    };
    let outcome = run(&test_executor(), action).await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, None);
    assert!(outcome.output.contains("failed to start command"));
}

#[tokio::test]
async fn test_execute_with_args_skips_shell() {
    // With explicit args the command is exec'd directly, so `$HOME` is not expanded.
    let action = JobAction::Shell {
        command: "echo".to_string(),
        args: vec!["$HOME".to_string(), "two words".to_string()],
    };
    let outcome = run(&test_executor(), action).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.output, "$HOME two words\n");
}

#[tokio::test]
async fn test_execute_large_output_is_truncated() {
    let executor = JobExecutor::new(100).unwrap();
    let outcome = run(&executor, JobAction::shell("seq 1 1000")).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(outcome.output.ends_with(TRUNCATION_MARKER));
    assert_eq!(outcome.output.len(), 100 + TRUNCATION_MARKER.len());
    assert!(outcome.output.starts_with("1\n2\n3\n"));
}

#[tokio::test]
async fn test_output_under_limit_is_not_marked() {
    let executor = JobExecutor::new(6).unwrap();
    let outcome = run(&executor, JobAction::shell("printf 123456")).await;

    assert_eq!(outcome.output, "123456");
}

#[tokio::test]
async fn test_deadline_kills_command() {
    let executor = test_executor();
    let start = Instant::now();
    let outcome = executor
        .execute(
            &JobAction::shell("echo started; sleep 30"),
            Some(Duration::from_millis(300)),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    assert_eq!(outcome.exit_code, None);
    assert!(outcome.output.starts_with("started"));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_kills_command() {
    let executor = test_executor();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = executor
        .execute(&JobAction::shell("sleep 30"), None, cancel)
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_executions() {
    let executor = test_executor();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let action = JobAction::shell(format!("echo job{}", i));
                let outcome = executor
                    .execute(&action, None, CancellationToken::new())
                    .await;
                (i, outcome)
            })
        })
        .collect();

    for handle in handles {
        let (i, outcome) = handle.await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.output, format!("job{}\n", i));
    }
}

// ============================================================================
// HTTP actions
// ============================================================================

async fn serve(port: u16) -> CancellationToken {
    let app = Router::new()
        .route("/ok", get(|| async { "pong" }).post(|body: String| async move { body }))
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/large", get(|| async { "x".repeat(100_000) }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });
    shutdown
}

fn http(port: u16, path: &str, method: &str, body: Option<&str>) -> JobAction {
    JobAction::Http {
        url: format!("http://127.0.0.1:{}{}", port, path),
        method: method.to_string(),
        body: body.map(str::to_string),
    }
}

#[tokio::test]
async fn test_http_action_success() {
    let server = serve(47400).await;
    let outcome = run(&test_executor(), http(47400, "/ok", "GET", None)).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.exit_code, None);
    assert_eq!(outcome.output, "HTTP 200 OK\npong");
    server.cancel();
}

#[tokio::test]
async fn test_http_action_sends_body() {
    let server = serve(47401).await;
    let outcome = run(
        &test_executor(),
        http(47401, "/ok", "POST", Some("payload")),
    )
    .await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(outcome.output.ends_with("payload"));
    server.cancel();
}

#[tokio::test]
async fn test_http_action_non_2xx_fails() {
    let server = serve(47402).await;
    let outcome = run(&test_executor(), http(47402, "/broken", "GET", None)).await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.output.starts_with("HTTP 500"));
    assert!(outcome.output.ends_with("boom"));
    server.cancel();
}

#[tokio::test]
async fn test_http_action_unreachable_fails() {
    let outcome = run(&test_executor(), http(47409, "/ok", "GET", None)).await;

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.output.starts_with("request failed"));
}

#[tokio::test]
async fn test_http_action_deadline() {
    let server = serve(47403).await;
    let outcome = test_executor()
        .execute(
            &http(47403, "/slow", "GET", None),
            Some(Duration::from_millis(300)),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    server.cancel();
}

#[tokio::test]
async fn test_http_large_body_is_truncated() {
    let server = serve(47404).await;
    let executor = JobExecutor::new(100).unwrap();
    let outcome = run(&executor, http(47404, "/large", "GET", None)).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(outcome.output.starts_with("HTTP 200 OK\nxxx"));
    assert!(outcome.output.ends_with(TRUNCATION_MARKER));
    assert_eq!(outcome.output.len(), 100 + TRUNCATION_MARKER.len());
    server.cancel();
}
