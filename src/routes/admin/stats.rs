//! Stats, request history, and analytics endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::AppState;
use crate::db;
use crate::error::ProxyError;
use crate::jobs::UsageWindowSnapshot;
use crate::scheduler::IntervalStats;
use crate::store::now_millis;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// --- Types ---

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub accounts: usize,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub avg_response_time_ms: Option<f64>,
    pub dropped_writes: u64,
    pub intervals: Vec<IntervalStats>,
    pub usage_windows: Vec<AccountUsageWindow>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountUsageWindow {
    pub account_id: String,
    pub window: UsageWindowSnapshot,
}

#[derive(Deserialize, ToSchema)]
pub struct RequestsQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct AnalyticsQuery {
    /// 1h, 6h, 24h, or 7d
    pub range: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsBucket {
    pub bucket_start: u64,
    pub requests: i64,
    pub successes: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub range: String,
    pub bucket_ms: u64,
    pub buckets: Vec<AnalyticsBucket>,
}

// --- Handlers ---

/// Aggregate proxy statistics
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "stats",
    responses((status = 200, body = StatsResponse))
)]
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, HandlerError> {
    let accounts = state.store.list_accounts().await.map_err(internal)?.len();

    let conn = db::get_conn().await.map_err(internal)?;
    let mut rows = conn
        .query(
            "SELECT COUNT(*), COALESCE(SUM(success), 0), COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0), AVG(response_time_ms)
             FROM requests",
            (),
        )
        .await
        .map_err(|e| internal(ProxyError::Database(e.to_string())))?;

    let (total, successes, tokens, cost, avg_ms) = match rows.next().await.ok().flatten() {
        Some(row) => (
            row.get::<i64>(0).unwrap_or(0),
            row.get::<i64>(1).unwrap_or(0),
            row.get::<i64>(2).unwrap_or(0),
            row.get::<f64>(3).unwrap_or(0.0),
            row.get::<Option<f64>>(4).ok().flatten(),
        ),
        None => (0, 0, 0, 0.0, None),
    };

    let usage_windows = state
        .usage_windows
        .read()
        .await
        .iter()
        .map(|(id, window)| AccountUsageWindow {
            account_id: id.to_string(),
            window: window.clone(),
        })
        .collect();

    Ok(Json(StatsResponse {
        accounts,
        total_requests: total,
        successful_requests: successes,
        total_tokens: tokens,
        total_cost_usd: cost,
        avg_response_time_ms: avg_ms,
        dropped_writes: state.store.dropped_writes(),
        intervals: state.intervals.stats(),
        usage_windows,
    }))
}

/// Most recent request records
#[utoipa::path(
    get,
    path = "/api/requests",
    tag = "stats",
    params(("limit" = Option<u32>, Query, description = "Max rows, default 50, cap 1000")),
    responses((status = 200, description = "Most recent request records"))
)]
pub async fn recent_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<Vec<Value>>, HandlerError> {
    let limit = query.limit.unwrap_or(50).min(1000);
    let rows = state
        .store
        .recent_requests(limit)
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

/// Archived payload blob for one request, when capture was enabled and
/// retention has not reclaimed it
#[utoipa::path(
    get,
    path = "/api/requests/{id}/payload",
    tag = "stats",
    params(("id" = String, Path, description = "Request ID")),
    responses(
        (status = 200, description = "Archived payload blob"),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn request_payload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    match state.store.get_request_payload(&id).await.map_err(internal)? {
        Some(payload) => Ok(Json(payload)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No payload for this request".into(),
            }),
        )),
    }
}

/// Bucketed request analytics over a trailing window
#[utoipa::path(
    get,
    path = "/api/analytics",
    tag = "stats",
    params(("range" = Option<String>, Query, description = "1h, 6h, 24h, or 7d (default 24h)")),
    responses(
        (status = 200, body = AnalyticsResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn analytics(
    State(_state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsResponse>, HandlerError> {
    let range = query.range.as_deref().unwrap_or("24h");
    let (window_ms, bucket_ms) = match range {
        "1h" => (60 * 60 * 1000_u64, 5 * 60 * 1000_u64),
        "6h" => (6 * 60 * 60 * 1000, 30 * 60 * 1000),
        "24h" => (24 * 60 * 60 * 1000, 60 * 60 * 1000),
        "7d" => (7 * 24 * 60 * 60 * 1000, 6 * 60 * 60 * 1000),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown range {other}; expected 1h, 6h, 24h, or 7d"),
                }),
            ));
        }
    };

    let since = now_millis().saturating_sub(window_ms);
    let conn = db::get_conn().await.map_err(internal)?;
    let mut rows = conn
        .query(
            "SELECT (timestamp / ?) * ? AS bucket,
                    COUNT(*),
                    COALESCE(SUM(success), 0),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM requests WHERE timestamp >= ?
             GROUP BY bucket ORDER BY bucket",
            (bucket_ms as i64, bucket_ms as i64, since as i64),
        )
        .await
        .map_err(|e| internal(ProxyError::Database(e.to_string())))?;

    let mut buckets = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        buckets.push(AnalyticsBucket {
            bucket_start: row.get::<i64>(0).unwrap_or(0) as u64,
            requests: row.get::<i64>(1).unwrap_or(0),
            successes: row.get::<i64>(2).unwrap_or(0),
            total_tokens: row.get::<i64>(3).unwrap_or(0),
            cost_usd: row.get::<f64>(4).unwrap_or(0.0),
        });
    }

    Ok(Json(AnalyticsResponse {
        range: range.to_string(),
        bucket_ms,
        buckets,
    }))
}
