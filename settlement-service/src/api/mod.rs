//! Read-only query surface for dashboards, plus tariff management and the
//! Prometheus endpoint.
//!
//! Every failure is a structured `{"status":"error","message":...}` payload
//! with a non-success status code; backend unavailability is a 500, a bad
//! `measurement`/`field` parameter a 400.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use community_client::db::{self, Measurement, QueryError};
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::engine::{TariffRates, TariffStore};
use crate::observability;

#[derive(Clone)]
pub struct ApiState {
    pub pool: Option<PgPool>,
    pub tariffs: Arc<TariffStore>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::UnknownMeasurement(_) | QueryError::UnknownField { .. } => {
                Self::bad_request(e.to_string())
            }
            QueryError::Sqlx(e) => Self::internal(e.to_string()),
        }
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tariffs", get(get_tariffs).post(update_tariffs))
        .route("/api/energy/summary", get(energy_summary))
        .route("/api/energy/community", get(community_energy))
        .route("/api/energy/house/:house_id", get(house_energy))
        .route("/api/energy/timeseries", get(energy_timeseries))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

/// Bind and serve the API until the process ends.
pub async fn serve(bind_addr: &str, state: ApiState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "query API listening");
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

fn require_pool(state: &ApiState) -> Result<PgPool, ApiError> {
    state
        .pool
        .clone()
        .ok_or_else(|| ApiError::unavailable("storage backend not configured".to_string()))
}

fn since(hours: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() - time::Duration::hours(hours.max(0))
}

#[derive(serde::Deserialize)]
struct WindowParams {
    hours: Option<i64>,
}

#[derive(serde::Deserialize)]
struct TimeseriesParams {
    hours: Option<i64>,
    measurement: Option<String>,
    field: Option<String>,
}

async fn health(State(state): State<ApiState>) -> ApiResult {
    let pool = require_pool(&state)?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({ "status": "ok" })))
}

async fn get_tariffs(State(state): State<ApiState>) -> ApiResult {
    let rates = state.tariffs.current();
    Ok(Json(json!({
        "status": "success",
        "tariffs": rates,
    })))
}

async fn update_tariffs(
    State(state): State<ApiState>,
    Json(rates): Json<TariffRates>,
) -> ApiResult {
    state
        .tariffs
        .store(rates)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::info!(
        p_pv = rates.p_pv,
        p_grid_del = rates.p_grid_del,
        p_grid_con = rates.p_grid_con,
        p_con = ?rates.p_con,
        "tariffs updated"
    );

    Ok(Json(json!({
        "status": "success",
        "tariffs": rates,
    })))
}

/// Per-house settlement totals over a trailing window (default 24 h).
async fn energy_summary(
    State(state): State<ApiState>,
    Query(params): Query<WindowParams>,
) -> ApiResult {
    let pool = require_pool(&state)?;
    let hours = params.hours.unwrap_or(24);

    let houses = db::house_summaries(&pool, since(hours))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({
        "status": "success",
        "period_hours": hours,
        "houses": houses,
    })))
}

async fn community_energy(
    State(state): State<ApiState>,
    Query(params): Query<WindowParams>,
) -> ApiResult {
    let pool = require_pool(&state)?;
    let hours = params.hours.unwrap_or(24);

    let community = db::community_summary(&pool, since(hours))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({
        "status": "success",
        "period_hours": hours,
        "community": community,
    })))
}

async fn house_energy(
    State(state): State<ApiState>,
    Path(house_id): Path<String>,
    Query(params): Query<WindowParams>,
) -> ApiResult {
    let pool = require_pool(&state)?;
    let hours = params.hours.unwrap_or(24);

    let energy = db::house_summary(&pool, &house_id, since(hours))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({
        "status": "success",
        "house_id": house_id,
        "period_hours": hours,
        "energy": energy,
    })))
}

/// Time series of one field for charting (default: community consumption
/// over the last hour).
async fn energy_timeseries(
    State(state): State<ApiState>,
    Query(params): Query<TimeseriesParams>,
) -> ApiResult {
    let pool = require_pool(&state)?;
    let hours = params.hours.unwrap_or(1);
    let measurement_name = params
        .measurement
        .unwrap_or_else(|| "community_energy".to_string());
    let field = params
        .field
        .unwrap_or_else(|| "total_consumption_kwh".to_string());

    let measurement: Measurement = measurement_name.parse().map_err(ApiError::from)?;
    let data = db::field_series(&pool, measurement, &field, since(hours)).await?;

    Ok(Json(json!({
        "status": "success",
        "measurement": measurement_name,
        "field": field,
        "data": data,
    })))
}

async fn metrics_endpoint() -> String {
    observability::render_metrics()
}
