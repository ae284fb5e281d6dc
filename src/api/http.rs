use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::JobService;
use crate::error::CadenceError;
use crate::scheduler::Job;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
}

/// Error wrapper mapping the crate error onto HTTP status codes.
pub struct ApiError(pub CadenceError);

impl From<CadenceError> for ApiError {
    fn from(e: CadenceError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &CadenceError) -> StatusCode {
    match error {
        CadenceError::JobNotFound(_) => StatusCode::NOT_FOUND,
        CadenceError::Conflict(_) => StatusCode::CONFLICT,
        CadenceError::InvalidJob(_)
        | CadenceError::ScheduleParse { .. }
        | CadenceError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CadenceError::StoreUnavailable(_) | CadenceError::NotLeader(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        let leader = match &self.0 {
            CadenceError::NotLeader(addr) => addr.clone(),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                leader,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct RunParams {
    #[serde(default)]
    forwarded: bool,
}

/// Routes under `/v1`.
pub fn routes(service: Arc<JobService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1", get(status_handler))
        .route("/v1/members", get(members_handler))
        .route("/v1/leader", get(leader_handler))
        .route("/v1/jobs", get(list_jobs_handler).post(upsert_job_handler))
        .route(
            "/v1/jobs/{job}",
            get(get_job_handler)
                .delete(delete_job_handler)
                .post(run_job_handler),
        )
        .route("/v1/executions/{job}", get(list_executions_handler))
        .layer(cors)
        .with_state(service)
}

async fn status_handler(State(service): State<Arc<JobService>>) -> impl IntoResponse {
    Json(service.status().await)
}

async fn members_handler(State(service): State<Arc<JobService>>) -> impl IntoResponse {
    Json(service.members().await)
}

async fn leader_handler(State(service): State<Arc<JobService>>) -> Response {
    match service.leader().await {
        Ok(Some(token)) => Json(token).into_response(),
        Ok(None) => ApiError(CadenceError::NotLeader(None)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn list_jobs_handler(State(service): State<Arc<JobService>>) -> ApiResult<Vec<Job>> {
    Ok(Json(service.list_jobs().await?))
}

async fn upsert_job_handler(
    State(service): State<Arc<JobService>>,
    Json(job): Json<Job>,
) -> std::result::Result<(StatusCode, Json<Job>), ApiError> {
    let saved = service.upsert_job(job).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_job_handler(
    State(service): State<Arc<JobService>>,
    Path(job): Path<String>,
) -> ApiResult<Job> {
    Ok(Json(service.get_job(&job).await?))
}

async fn delete_job_handler(
    State(service): State<Arc<JobService>>,
    Path(job): Path<String>,
) -> ApiResult<Job> {
    Ok(Json(service.delete_job(&job).await?))
}

async fn run_job_handler(
    State(service): State<Arc<JobService>>,
    Path(job): Path<String>,
    Query(params): Query<RunParams>,
) -> std::result::Result<(StatusCode, Json<crate::dispatcher::DispatchResult>), ApiError> {
    let result = service.run_job(&job, params.forwarded).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn list_executions_handler(
    State(service): State<Arc<JobService>>,
    Path(job): Path<String>,
) -> ApiResult<Vec<crate::scheduler::Execution>> {
    Ok(Json(service.list_executions(&job).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&CadenceError::JobNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CadenceError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CadenceError::ScheduleParse {
                expr: "x".into(),
                reason: "y".into()
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&CadenceError::NotLeader(None)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CadenceError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
