use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::agent::Runner;
use crate::api::{http as api_http, JobService};
use crate::dispatcher::Dispatcher;
use crate::error::{CadenceError, Result};
use crate::membership::{GossipMessage, Membership};
use crate::rpc::{
    CancelResponse, ExecutionRef, ExecutionReport, JobChanged, RunRequest, StatusResponse,
};
use crate::scheduler::SchedulerHandle;
use crate::store::{store_router, MemoryStore};

/// Shared state of the `/internal/*` handlers.
#[derive(Clone)]
pub struct InternalState {
    pub runner: Arc<Runner>,
    pub dispatcher: Arc<Dispatcher>,
    pub membership: Arc<Membership>,
    pub scheduler: SchedulerHandle,
}

/// Everything one node serves: internal endpoints, the `/v1` API and,
/// when hosted here, the store.
pub fn router(
    internal: InternalState,
    api: Arc<JobService>,
    hosted_store: Option<Arc<MemoryStore>>,
) -> Router {
    let mut app = Router::new()
        .route("/internal/gossip", post(gossip_handler))
        .route("/internal/run", post(run_handler))
        .route("/internal/cancel", post(cancel_handler))
        .route("/internal/status", post(status_handler))
        .route("/internal/report", post(report_handler))
        .route("/internal/job-changed", post(job_changed_handler))
        .with_state(internal)
        .merge(api_http::routes(api));

    if let Some(store) = hosted_store {
        app = app.merge(store_router(store));
    }
    app.layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    listener: TcpListener,
    app: Router,
}

impl HttpServer {
    /// Bind now so callers learn about port conflicts before anything runs.
    pub async fn bind(addr: SocketAddr, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CadenceError::Internal(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, app })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| CadenceError::Internal(e.to_string()))
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "Starting HTTP server");
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| CadenceError::Internal(format!("http server failed: {}", e)))
    }
}

async fn gossip_handler(
    State(state): State<InternalState>,
    Json(message): Json<GossipMessage>,
) -> impl IntoResponse {
    tracing::trace!(from = %message.from, members = message.members.len(), "Gossip received");
    Json(state.membership.handle_gossip(message).await)
}

async fn run_handler(
    State(state): State<InternalState>,
    Json(request): Json<RunRequest>,
) -> impl IntoResponse {
    tracing::debug!(job = %request.job, group = %request.group, "Run request received");
    Json(state.runner.accept(request).await)
}

async fn cancel_handler(
    State(state): State<InternalState>,
    Json(target): Json<ExecutionRef>,
) -> impl IntoResponse {
    let cancelled = state.runner.cancel(&target.job, &target.group).await;
    Json(CancelResponse { cancelled })
}

async fn status_handler(
    State(state): State<InternalState>,
    Json(target): Json<ExecutionRef>,
) -> impl IntoResponse {
    let status = state.runner.status(&target.job, &target.group).await;
    Json(StatusResponse { status })
}

async fn report_handler(
    State(state): State<InternalState>,
    Json(report): Json<ExecutionReport>,
) -> impl IntoResponse {
    state.dispatcher.handle_report(report).await;
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

async fn job_changed_handler(
    State(state): State<InternalState>,
    Json(changed): Json<JobChanged>,
) -> impl IntoResponse {
    tracing::debug!(job = %changed.job, "Job change notification received");
    state.scheduler.job_changed(&changed.job);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}
