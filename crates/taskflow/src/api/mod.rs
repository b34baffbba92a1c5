use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterJob, DeadLetterStore};
use crate::error::Error;
use crate::jobs::timeline::build_timeline;
use crate::ledger::{ExecutionLedger, JobExecution};
use crate::queue::{DispatchQueue, QueueDepth};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::tasks::TaskScheduler;

/// Read-mostly admin surface over the queue, ledger and dead-letter store.
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<dyn DispatchQueue>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub scheduler: TaskScheduler,
    pub stats: Arc<StatsAggregator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/queue", get(queue_depth))
        .route("/jobs/:id/timeline", get(get_timeline))
        .route("/tasks/:id/executions", get(list_task_executions))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id", delete(purge_dead_letter))
        .route("/dead-letters/:id/replay", post(replay_dead_letter))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::TaskNotFound(_) | Error::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            Error::TaskInactive { .. } => StatusCode::CONFLICT,
            Error::InvalidSchedule(_) | Error::InvalidScheduleExpression(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "admin api request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn stats(State(state): State<ApiState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

pub async fn queue_depth(State(state): State<ApiState>) -> ApiResult<QueueDepth> {
    Ok(Json(state.queue.depth().await?))
}

pub async fn get_timeline(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Response {
    match build_timeline(
        state.queue.as_ref(),
        state.ledger.as_ref(),
        state.dead_letters.as_ref(),
        id,
    )
    .await
    {
        Ok(Some(tl)) => (StatusCode::OK, Json(tl)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".into(),
            }),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
    pub task_id: Option<Uuid>,
}

pub async fn list_task_executions(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<JobExecution>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    Ok(Json(state.ledger.executions_for_task(id, limit).await?))
}

pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<DeadLetterJob>> {
    let items = match q.task_id {
        Some(task_id) => state.dead_letters.list_for_task(task_id).await?,
        None => {
            state
                .dead_letters
                .list(q.limit.unwrap_or(100).clamp(1, 500))
                .await?
        }
    };
    Ok(Json(items))
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub new_job_id: Uuid,
    pub replay_of_job_id: Uuid,
    pub task_id: Uuid,
}

pub async fn replay_dead_letter(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> ApiResult<ReplayResponse> {
    let replay_of_job_id = state
        .dead_letters
        .get(id)
        .await?
        .map(|dl| dl.job_id)
        .ok_or(Error::DeadLetterNotFound(id))?;

    let job = state.scheduler.replay_dead_letter(id).await?;
    Ok(Json(ReplayResponse {
        new_job_id: job.job_id,
        replay_of_job_id,
        task_id: job.task_id,
    }))
}

pub async fn purge_dead_letter(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.purge_dead_letter(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
