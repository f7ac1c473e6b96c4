use axum::{extract::State, response::Json};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let accounts = state
        .store
        .list_accounts()
        .await
        .map(|a| a.len())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "accounts": accounts,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": crate::VERSION,
        "git_hash": crate::GIT_HASH,
        "build_time": crate::BUILD_TIME,
    }))
}
