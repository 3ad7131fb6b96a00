use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    autotune::AutoTuneSnapshot,
    metrics::AdmissionMetrics,
    ratelimit::{Admission, registry::RateLimitBudgetRegistry},
    upstream::UpstreamRegistry,
};

#[derive(Clone)]
pub struct AppState {
    budgets: Arc<RateLimitBudgetRegistry>,
    upstreams: Arc<UpstreamRegistry>,
    metrics: Arc<AdmissionMetrics>,
}

impl AppState {
    pub fn new(
        budgets: Arc<RateLimitBudgetRegistry>,
        upstreams: Arc<UpstreamRegistry>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            budgets,
            upstreams,
            metrics,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BackendUnavailable,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BackendUnavailable => "rate_limiter_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotFound(what) => format!("{what} not found"),
            Self::BackendUnavailable => "Rate limiter backend unavailable".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.message(),
        });
        (self.status(), body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    pub method: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmitResponse {
    pub allowed: bool,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/budgets/{name}/admit", post(admit_budget))
        .route("/v1/upstreams/{id}/admit", post(admit_upstream))
        .route("/v1/upstreams/{id}/errors", post(record_error))
        .route("/v1/upstreams/{id}/auto-tune", get(auto_tune_snapshot))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus(&state.upstreams))
}

async fn admit_budget(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AdmitRequest>,
) -> Result<Json<AdmitResponse>, ApiError> {
    let budget = state
        .budgets
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("budget {name}")))?;

    let admission = budget.decide(&request.method).await;
    state.metrics.budget_decision(admission);
    tracing::debug!(
        request_id = %request_id(&headers),
        budget = %name,
        method = %request.method,
        admission = ?admission,
        "budget admission"
    );
    respond(admission)
}

async fn admit_upstream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AdmitRequest>,
) -> Result<Json<AdmitResponse>, ApiError> {
    let upstream = state
        .upstreams
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("upstream {id}")))?;

    let admission = upstream.admit(&request.method).await;
    state.metrics.upstream_decision(admission);
    tracing::debug!(
        request_id = %request_id(&headers),
        upstream = %id,
        method = %request.method,
        admission = ?admission,
        "upstream admission"
    );
    respond(admission)
}

async fn record_error(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let upstream = state
        .upstreams
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("upstream {id}")))?;

    upstream.record_error();
    state.metrics.upstream_error();
    Ok(StatusCode::NO_CONTENT)
}

async fn auto_tune_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AutoTuneSnapshot>, ApiError> {
    state
        .upstreams
        .get(&id)
        .and_then(|upstream| upstream.auto_tune().map(|auto_tune| auto_tune.snapshot()))
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("auto-tune for upstream {id}")))
}

fn respond(admission: Admission) -> Result<Json<AdmitResponse>, ApiError> {
    match admission {
        Admission::Unavailable => Err(ApiError::BackendUnavailable),
        other => Ok(Json(AdmitResponse {
            allowed: other.is_allowed(),
        })),
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
