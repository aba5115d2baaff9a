use crate::queue::{Dispatcher, Job, JobCounts, QueueError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct QueueSummary {
    name: String,
    #[serde(flatten)]
    counts: JobCounts,
}

/// Operator endpoints for queue introspection
pub fn create_queue_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/api/queues", get(list_queues))
        .route("/api/queues/:name/stats", get(queue_stats))
        .route("/api/queues/:name/failed", get(failed_jobs))
        .with_state(dispatcher)
}

/// GET /api/queues
async fn list_queues(State(dispatcher): State<Dispatcher>) -> Json<Vec<QueueSummary>> {
    let summaries = dispatcher
        .queue_names()
        .into_iter()
        .filter_map(|name| {
            dispatcher
                .stats(&name)
                .ok()
                .map(|counts| QueueSummary { name, counts })
        })
        .collect();
    Json(summaries)
}

/// GET /api/queues/:name/stats
async fn queue_stats(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
) -> Result<Json<JobCounts>, QueueApiError> {
    Ok(Json(dispatcher.stats(&name)?))
}

/// GET /api/queues/:name/failed
async fn failed_jobs(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Job>>, QueueApiError> {
    Ok(Json(dispatcher.failed_jobs(&name)?))
}

struct QueueApiError(QueueError);

impl From<QueueError> for QueueApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for QueueApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            QueueError::UnknownQueue(_) => StatusCode::NOT_FOUND,
            QueueError::Duplicate { .. } => StatusCode::CONFLICT,
            QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
