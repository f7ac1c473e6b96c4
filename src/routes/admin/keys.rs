//! Inbound API key administration. The plaintext key appears exactly once,
//! in the creation response.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{ErrorResponse, SuccessResponse, validate_name};
use crate::AppState;
use crate::api_keys::{ApiKey, KeyRole};
use crate::error::ProxyError;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn to_handler_error(e: ProxyError) -> HandlerError {
    let status = match &e {
        ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// --- Types ---

#[derive(Deserialize, Serialize, ToSchema)]
pub struct CreateApiKeyRequest {
    pub name: String,
    /// "admin" or "api-only" (default)
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyResponse {
    pub id: String,
    pub name: String,
    /// Shown once; only the salted hash is stored
    pub key: String,
    pub role: KeyRole,
}

#[derive(Serialize, ToSchema)]
pub struct ListApiKeysResponse {
    pub keys: Vec<ApiKey>,
}

// --- Handlers ---

/// Issue a new inbound API key
#[utoipa::path(
    post,
    path = "/api/api-keys",
    tag = "api-keys",
    request_body = CreateApiKeyRequest,
    responses(
        (status = 200, body = CreateApiKeyResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<CreateApiKeyResponse>, HandlerError> {
    let name = body.name.trim().to_string();
    validate_name(&name).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    let role = match body.role.as_deref() {
        None => KeyRole::ApiOnly,
        Some(r) => KeyRole::parse(r).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "role must be admin or api-only".into(),
                }),
            )
        })?,
    };

    let existing = state.api_keys.list().await.map_err(to_handler_error)?;
    if existing.iter().any(|k| k.name == name) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "a key with this name already exists".into(),
            }),
        ));
    }

    let (key, plaintext) = state
        .api_keys
        .create(&name, role)
        .await
        .map_err(to_handler_error)?;
    Ok(Json(CreateApiKeyResponse {
        id: key.id,
        name: key.name,
        key: plaintext,
        role: key.role,
    }))
}

/// List issued keys (hashes and plaintext never included)
#[utoipa::path(
    get,
    path = "/api/api-keys",
    tag = "api-keys",
    responses((status = 200, body = ListApiKeysResponse))
)]
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListApiKeysResponse>, HandlerError> {
    let keys = state.api_keys.list().await.map_err(to_handler_error)?;
    Ok(Json(ListApiKeysResponse { keys }))
}

/// Revoke a key by name
#[utoipa::path(
    delete,
    path = "/api/api-keys/{name}",
    tag = "api-keys",
    params(("name" = String, Path, description = "Key name")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state.api_keys.delete(&name).await.map_err(to_handler_error)? {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".into(),
            }),
        )),
    }
}

/// Re-enable a disabled key
#[utoipa::path(
    post,
    path = "/api/api-keys/{name}/enable",
    tag = "api-keys",
    params(("name" = String, Path, description = "Key name")),
    responses((status = 200, body = SuccessResponse), (status = 404, body = ErrorResponse))
)]
pub async fn enable_api_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    set_enabled(&state, &name, true).await
}

/// Disable a key without deleting it
#[utoipa::path(
    post,
    path = "/api/api-keys/{name}/disable",
    tag = "api-keys",
    params(("name" = String, Path, description = "Key name")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn disable_api_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    set_enabled(&state, &name, false).await
}

async fn set_enabled(
    state: &AppState,
    name: &str,
    enabled: bool,
) -> Result<Json<SuccessResponse>, HandlerError> {
    match state
        .api_keys
        .set_enabled(name, enabled)
        .await
        .map_err(to_handler_error)?
    {
        true => Ok(Json(SuccessResponse { success: true })),
        false => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".into(),
            }),
        )),
    }
}
