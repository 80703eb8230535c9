//! REST API
//!
//! JSON over HTTP. Event admission and batch lifecycle routes serve the
//! internal ingestion collaborator; rollup, freshness, and export routes
//! serve dashboards, alerting, and export clients.

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use tally_common::{
    AdmitOutcome, BatchCloseReport, ExportJob, ExportRequest, ExportStatus, FreshnessStatus, Granularity,
    IngestionBatch, RollupBucket, TallyError, TimeRange, UsageEvent, VERSION,
};
use tally_storage::RollupQuery;

use crate::Tally;

/// `TallyError` rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(TallyError);

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            TallyError::Validation(_) => StatusCode::BAD_REQUEST,
            TallyError::NotFound(_) => StatusCode::NOT_FOUND,
            TallyError::ExportInFlight { .. } | TallyError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TallyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else if status == StatusCode::CONFLICT {
            warn!(error = %self.0, "Request conflicts with current state");
        } else {
            debug!(error = %self.0, "Client error");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router
pub fn router(tally: Arc<Tally>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Ingestion
        .route("/v1/events", post(admit_events))
        .route("/v1/batches/open", get(open_batches))
        .route("/v1/batches/:batch_id/close", post(close_batch))
        .route("/v1/organizations/:organization_id", post(register_organization))
        // Reads
        .route("/v1/rollups", get(query_rollups))
        .route("/v1/freshness", get(global_freshness))
        .route("/v1/freshness/:organization_id", get(organization_freshness))
        // Exports
        .route("/v1/exports", post(submit_export))
        .route("/v1/exports/:job_id", get(export_status))
        .route("/v1/exports/:job_id/cancel", post(cancel_export))
        .route("/v1/organizations/:organization_id/exports", get(list_exports))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(tally)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": VERSION,
    }))
}

async fn metrics(State(tally): State<Arc<Tally>>) -> ApiResult<impl IntoResponse> {
    let body = tally.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// One event or a list of events
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Many(Vec<UsageEvent>),
    One(UsageEvent),
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmitResponse {
    pub inserted: usize,
    pub duplicates: usize,
    pub expired: usize,
}

/// Admit events; the whole payload is validated before any is stored
async fn admit_events(
    State(tally): State<Arc<Tally>>,
    Json(payload): Json<EventPayload>,
) -> ApiResult<Json<AdmitResponse>> {
    let events = match payload {
        EventPayload::Many(events) => events,
        EventPayload::One(event) => vec![event],
    };
    for event in &events {
        event.validate()?;
    }

    let mut response = AdmitResponse::default();
    for event in events {
        match tally.admit(event).await? {
            AdmitOutcome::Inserted => response.inserted += 1,
            AdmitOutcome::Duplicate => response.duplicates += 1,
            AdmitOutcome::Expired => response.expired += 1,
        }
    }
    Ok(Json(response))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegisterOrganization {
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

async fn register_organization(
    State(tally): State<Arc<Tally>>,
    Path(organization_id): Path<String>,
    Json(body): Json<RegisterOrganization>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let created_at = tally.register_organization(&organization_id, body.created_at).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "organization_id": organization_id,
            "created_at": created_at,
        })),
    ))
}

async fn open_batches(State(tally): State<Arc<Tally>>) -> ApiResult<Json<Vec<IngestionBatch>>> {
    Ok(Json(tally.tracker.open_batches().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseBatchResponse {
    pub batch_id: String,
    pub already_closed: bool,
    pub report: Option<BatchCloseReport>,
}

async fn close_batch(
    State(tally): State<Arc<Tally>>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<CloseBatchResponse>> {
    let report = tally.tracker.close_batch(&batch_id).await?;
    Ok(Json(CloseBatchResponse {
        batch_id,
        already_closed: report.is_none(),
        report,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RollupParams {
    pub granularity: Granularity,
    pub organization_id: String,
    pub model_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub finalized_only: bool,
}

async fn query_rollups(
    State(tally): State<Arc<Tally>>,
    Query(params): Query<RollupParams>,
) -> ApiResult<Json<Vec<RollupBucket>>> {
    let query = RollupQuery {
        granularity: params.granularity,
        organization_id: params.organization_id,
        model_id: params.model_id,
        range: TimeRange::new(params.from, params.to)?,
        finalized_only: params.finalized_only,
    };
    Ok(Json(tally.aggregator.query(&query).await?))
}

async fn global_freshness(State(tally): State<Arc<Tally>>) -> ApiResult<Json<FreshnessStatus>> {
    Ok(Json(tally.freshness.evaluate_global().await?))
}

async fn organization_freshness(
    State(tally): State<Arc<Tally>>,
    Path(organization_id): Path<String>,
) -> ApiResult<Json<FreshnessStatus>> {
    Ok(Json(tally.freshness.status(&organization_id).await?))
}

async fn submit_export(
    State(tally): State<Arc<Tally>>,
    Json(request): Json<ExportRequest>,
) -> ApiResult<(StatusCode, Json<ExportJob>)> {
    let job = tally.exports.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn export_status(State(tally): State<Arc<Tally>>, Path(job_id): Path<Uuid>) -> ApiResult<Json<ExportJob>> {
    Ok(Json(tally.exports.get_status(job_id).await?))
}

async fn cancel_export(State(tally): State<Arc<Tally>>, Path(job_id): Path<Uuid>) -> ApiResult<Json<ExportJob>> {
    Ok(Json(tally.exports.cancel(job_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

async fn list_exports(
    State(tally): State<Arc<Tally>>,
    Path(organization_id): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ExportJob>>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ExportStatus>)
        .transpose()?;
    Ok(Json(tally.exports.list(&organization_id, status).await?))
}
