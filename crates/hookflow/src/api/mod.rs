use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::error;
use uuid::Uuid;

use crate::api::models::{JobView, RetryResponse, WebhookResponse};
use crate::jobs::model::QueueStats;
use crate::jobs::queue::{JobQueue, QueueError};
use crate::webhooks::ingest::{IngestError, IngestService};
use crate::webhooks::model::WebhookRecord;
use crate::webhooks::records::WebhookRecords;

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub ingest: IngestService,
    pub queue: JobQueue,
    pub records: WebhookRecords,
}

impl ApiState {
    pub fn new(ingest: IngestService) -> Self {
        Self {
            queue: ingest.queue().clone(),
            records: ingest.records().clone(),
            ingest,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Ingress
        .route("/webhooks/:platform", post(receive_webhook))
        // Admin / inspect
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/queue/stats", get(queue_stats))
        .route("/records/:id", get(get_record))
        .route("/records/:id/retry", post(retry_record))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!(error = %self, "webhook request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(WebhookResponse::error(message))).into_response()
    }
}

pub async fn receive_webhook(
    State(state): State<ApiState>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    let accepted = state.ingest.accept(&platform, &headers, &body).await?;
    let message = if accepted.duplicate {
        "Duplicate webhook ignored"
    } else {
        "Webhook received"
    };
    Ok(Json(WebhookResponse::ok(message)))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, (StatusCode, String)> {
    match state.queue.get(id).await {
        Ok(job) => Ok(Json(JobView::from(job))),
        Err(QueueError::NotFound(_)) => Err((StatusCode::NOT_FOUND, format!("job {id} not found"))),
        Err(e) => Err(internal_err(e)),
    }
}

pub async fn retry_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RetryResponse>, IngestError> {
    let job = state.ingest.retry_job(id).await?;
    Ok(Json(RetryResponse { success: true, job }))
}

pub async fn queue_stats(State(state): State<ApiState>) -> Result<Json<QueueStats>, (StatusCode, String)> {
    let stats = state.queue.stats().await.map_err(internal_err)?;
    Ok(Json(stats))
}

pub async fn get_record(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WebhookRecord>, (StatusCode, String)> {
    match state.records.get(id).await.map_err(internal_err)? {
        Some(record) => Ok(Json(record)),
        None => Err((StatusCode::NOT_FOUND, format!("webhook record {id} not found"))),
    }
}

pub async fn retry_record(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RetryResponse>, IngestError> {
    let job = state.ingest.retry_webhook(id).await?;
    Ok(Json(RetryResponse { success: true, job }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
