//! Account administration endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ErrorResponse, SuccessResponse, validate_endpoint, validate_name};
use crate::AppState;
use crate::accounts::{Account, AccountView, ProviderKind};
use crate::store::now_millis;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn bad_request(msg: impl Into<String>) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn not_found() -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Account not found".into(),
        }),
    )
}

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
pub struct ListAccountsResponse {
    pub accounts: Vec<AccountView>,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub name: String,
    /// "anthropic-console-key", "openai-compatible", or "other-api-key";
    /// OAuth accounts are created through the /api/oauth flow instead.
    pub provider: String,
    pub api_key: String,
    #[serde(default)]
    pub custom_endpoint: Option<String>,
    #[serde(default)]
    pub model_mappings: Option<HashMap<String, String>>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetPriorityRequest {
    pub priority: i64,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetTierRequest {
    pub tier: i64,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetAutoFallbackRequest {
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetCustomEndpointRequest {
    /// null clears the endpoint
    pub endpoint: Option<String>,
}

// --- Handlers ---

/// List accounts with redacted credentials
#[utoipa::path(
    get,
    path = "/api/accounts",
    tag = "accounts",
    responses((status = 200, body = ListAccountsResponse))
)]
pub async fn list_accounts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListAccountsResponse>, HandlerError> {
    let accounts = state.store.list_accounts().await.map_err(internal)?;
    Ok(Json(ListAccountsResponse {
        accounts: accounts.iter().map(AccountView::from).collect(),
    }))
}

/// Add a key-based account (console key, OpenAI-compatible, or bearer)
#[utoipa::path(
    post,
    path = "/api/accounts",
    tag = "accounts",
    request_body = CreateAccountRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAccountRequest>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    validate_name(&body.name).map_err(bad_request)?;
    let provider = ProviderKind::parse(&body.provider)
        .filter(|p| !p.uses_oauth())
        .ok_or_else(|| bad_request("provider must be a key-based kind"))?;
    if provider == ProviderKind::OpenaiCompatible && body.custom_endpoint.is_none() {
        return Err(bad_request("openai-compatible accounts need a custom endpoint"));
    }
    if let Some(endpoint) = &body.custom_endpoint {
        validate_endpoint(endpoint).map_err(bad_request)?;
    }
    if state
        .store
        .get_account_by_name(&body.name)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(bad_request("an account with this name already exists"));
    }

    let account = Account {
        id: Uuid::new_v4(),
        name: body.name.trim().to_string(),
        provider,
        refresh_token: None,
        access_token: None,
        access_token_expires_at: None,
        api_key: Some(body.api_key),
        custom_endpoint: body.custom_endpoint,
        model_mappings: body.model_mappings,
        priority: body.priority,
        tier: 1,
        paused: false,
        auto_fallback_enabled: false,
        auto_refresh_enabled: false,
        rate_limited_until: None,
        rate_limit_remaining: None,
        rate_limit_reset: None,
        rate_limit_status: None,
        session_start: None,
        session_request_count: 0,
        request_count: 0,
        total_requests: 0,
        last_used: None,
        created_at: now_millis(),
    };
    state.store.insert_account(&account).await.map_err(internal)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Remove an account
#[utoipa::path(
    delete,
    path = "/api/accounts/{id}",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state.store.delete_account(id).await.map_err(internal)? {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Change an account's priority (smaller = preferred)
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/priority",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    request_body = SetPriorityRequest,
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn set_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetPriorityRequest>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state
        .store
        .set_priority(id, body.priority)
        .await
        .map_err(internal)?
    {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Change an account's subscription tier
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/tier",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    request_body = SetTierRequest,
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn set_tier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetTierRequest>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    if !matches!(body.tier, 1 | 5 | 20) {
        return Err(bad_request("tier must be 1, 5, or 20"));
    }
    match state.store.set_tier(id, body.tier).await.map_err(internal)? {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Toggle auto-fallback for an account
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/auto-fallback",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    request_body = SetAutoFallbackRequest,
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn set_auto_fallback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetAutoFallbackRequest>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state
        .store
        .set_auto_fallback(id, body.enabled)
        .await
        .map_err(internal)?
    {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Set or clear an account's custom upstream endpoint
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/custom-endpoint",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    request_body = SetCustomEndpointRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn set_custom_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetCustomEndpointRequest>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    if let Some(endpoint) = &body.endpoint {
        validate_endpoint(endpoint).map_err(bad_request)?;
    }
    match state
        .store
        .set_custom_endpoint(id, body.endpoint.as_deref())
        .await
        .map_err(internal)?
    {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Pause an account (excluded from selection)
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/pause",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn pause_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state.store.set_paused(id, true).await.map_err(internal)? {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}

/// Resume a paused account
#[utoipa::path(
    post,
    path = "/api/accounts/{id}/resume",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn resume_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state.store.set_paused(id, false).await.map_err(internal)? {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err(not_found()),
    }
}
