//! Runtime configuration endpoints. PATCHed values apply live and persist
//! to the runtime_config table so they survive restarts.

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::AppState;
use crate::db;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub port: u16,
    pub host: String,
    pub session_duration_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub data_retention_days: u32,
    pub request_retention_days: u32,
    pub strategy: String,
    pub capture_payloads: bool,
}

#[derive(Deserialize, Serialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchConfigRequest {
    pub session_duration_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub retry_backoff: Option<f64>,
    pub data_retention_days: Option<u32>,
    pub request_retention_days: Option<u32>,
    pub capture_payloads: Option<bool>,
}

#[derive(Serialize, ToSchema)]
pub struct StrategyResponse {
    pub strategy: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetStrategyRequest {
    pub strategy: String,
}

async fn persist(key: &str, value: &str) {
    if let Ok(conn) = db::get_conn().await
        && let Err(e) = conn
            .execute(
                "INSERT OR REPLACE INTO runtime_config (key, value) VALUES (?, ?)",
                (key, value),
            )
            .await
    {
        tracing::warn!("Failed to persist config {key}: {e}");
    }
}

/// Current effective configuration
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "config",
    responses((status = 200, body = ConfigResponse))
)]
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let runtime = state.runtime.read().await;
    Json(ConfigResponse {
        port: state.config.port,
        host: state.config.host.clone(),
        session_duration_ms: runtime.session_duration_ms,
        retry_attempts: runtime.retry_attempts,
        retry_delay_ms: runtime.retry_delay_ms,
        retry_backoff: runtime.retry_backoff,
        data_retention_days: runtime.data_retention_days,
        request_retention_days: runtime.request_retention_days,
        strategy: runtime.strategy.clone(),
        capture_payloads: runtime.capture_payloads,
    })
}

/// Update runtime-mutable settings
#[utoipa::path(
    patch,
    path = "/api/config",
    tag = "config",
    request_body = PatchConfigRequest,
    responses(
        (status = 200, body = ConfigResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn patch_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PatchConfigRequest>,
) -> Result<Json<ConfigResponse>, HandlerError> {
    if body.retry_backoff.is_some_and(|b| b < 1.0 || !b.is_finite()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "retryBackoff must be a finite number >= 1".into(),
            }),
        ));
    }
    if body.session_duration_ms.is_some_and(|ms| ms == 0) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "sessionDurationMs must be positive".into(),
            }),
        ));
    }

    {
        let mut runtime = state.runtime.write().await;
        if let Some(v) = body.session_duration_ms {
            runtime.session_duration_ms = v;
            persist("session_duration_ms", &v.to_string()).await;
        }
        if let Some(v) = body.retry_attempts {
            runtime.retry_attempts = v;
            persist("retry_attempts", &v.to_string()).await;
        }
        if let Some(v) = body.retry_delay_ms {
            runtime.retry_delay_ms = v;
            persist("retry_delay_ms", &v.to_string()).await;
        }
        if let Some(v) = body.retry_backoff {
            runtime.retry_backoff = v;
            persist("retry_backoff", &v.to_string()).await;
        }
        if let Some(v) = body.data_retention_days {
            runtime.data_retention_days = v;
            persist("data_retention_days", &v.to_string()).await;
        }
        if let Some(v) = body.request_retention_days {
            runtime.request_retention_days = v;
            persist("request_retention_days", &v.to_string()).await;
        }
        if let Some(v) = body.capture_payloads {
            runtime.capture_payloads = v;
            persist("capture_payloads", &v.to_string()).await;
        }
    }

    Ok(get_config(State(state)).await)
}

/// Current selection strategy
#[utoipa::path(
    get,
    path = "/api/config/strategy",
    tag = "config",
    responses((status = 200, body = StrategyResponse))
)]
pub async fn get_strategy(State(state): State<Arc<AppState>>) -> Json<StrategyResponse> {
    Json(StrategyResponse {
        strategy: state.runtime.read().await.strategy.clone(),
    })
}

/// Set the selection strategy ("session" is the only supported value)
#[utoipa::path(
    post,
    path = "/api/config/strategy",
    tag = "config",
    request_body = SetStrategyRequest,
    responses(
        (status = 200, body = StrategyResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn set_strategy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetStrategyRequest>,
) -> Result<Json<StrategyResponse>, HandlerError> {
    if body.strategy != "session" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown strategy {}; only \"session\" is supported", body.strategy),
            }),
        ));
    }
    state.runtime.write().await.strategy = body.strategy.clone();
    persist("strategy", &body.strategy).await;
    Ok(Json(StrategyResponse {
        strategy: body.strategy,
    }))
}

/// Load persisted runtime config overrides at startup.
pub async fn load_runtime_overrides(state: &AppState) {
    let Ok(conn) = db::get_conn().await else {
        return;
    };
    let Ok(mut rows) = conn.query("SELECT key, value FROM runtime_config", ()).await else {
        return;
    };
    let mut runtime = state.runtime.write().await;
    while let Ok(Some(row)) = rows.next().await {
        let (Ok(key), Ok(value)) = (row.get::<String>(0), row.get::<String>(1)) else {
            continue;
        };
        match key.as_str() {
            "session_duration_ms" => {
                if let Ok(v) = value.parse() {
                    runtime.session_duration_ms = v;
                }
            }
            "retry_attempts" => {
                if let Ok(v) = value.parse() {
                    runtime.retry_attempts = v;
                }
            }
            "retry_delay_ms" => {
                if let Ok(v) = value.parse() {
                    runtime.retry_delay_ms = v;
                }
            }
            "retry_backoff" => {
                if let Ok(v) = value.parse() {
                    runtime.retry_backoff = v;
                }
            }
            "data_retention_days" => {
                if let Ok(v) = value.parse() {
                    runtime.data_retention_days = v;
                }
            }
            "request_retention_days" => {
                if let Ok(v) = value.parse() {
                    runtime.request_retention_days = v;
                }
            }
            "capture_payloads" => {
                if let Ok(v) = value.parse() {
                    runtime.capture_payloads = v;
                }
            }
            "strategy" => runtime.strategy = value,
            _ => {}
        }
    }
}
