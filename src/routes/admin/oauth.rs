//! OAuth account onboarding endpoints. Exempt from the auth gate so a fresh
//! install can bootstrap its first account; the flow itself is protected by
//! PKCE and the short session TTL.

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ErrorResponse, validate_name};
use crate::AppState;
use crate::accounts::AccountView;
use crate::error::ProxyError;

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn to_handler_error(e: ProxyError) -> HandlerError {
    let status = match &e {
        ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
        ProxyError::OAuth(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct OAuthInitRequest {
    pub name: String,
    /// "max" enables session auto-refresh for the new account
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OAuthInitResponse {
    pub session_id: Uuid,
    pub authorize_url: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCallbackRequest {
    pub session_id: Uuid,
    /// The pasted "code#state" string from the authorize redirect
    pub code: String,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct OAuthCallbackResponse {
    pub account: AccountView,
}

/// Begin an OAuth account-add flow
#[utoipa::path(
    post,
    path = "/api/oauth/init",
    tag = "oauth",
    request_body = OAuthInitRequest,
    responses(
        (status = 200, body = OAuthInitResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn oauth_init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OAuthInitRequest>,
) -> Result<Json<OAuthInitResponse>, HandlerError> {
    let name = body.name.trim().to_string();
    validate_name(&name).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    if state
        .store
        .get_account_by_name(&name)
        .await
        .map_err(to_handler_error)?
        .is_some()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "an account with this name already exists".into(),
            }),
        ));
    }

    let mode = body.mode.as_deref().unwrap_or("console");
    let (session_id, authorize_url) = state
        .oauth_flow
        .begin(&name, mode)
        .await
        .map_err(to_handler_error)?;
    Ok(Json(OAuthInitResponse {
        session_id,
        authorize_url,
    }))
}

/// Complete an OAuth flow with the pasted authorization code
#[utoipa::path(
    post,
    path = "/api/oauth/callback",
    tag = "oauth",
    request_body = OAuthCallbackRequest,
    responses(
        (status = 200, body = OAuthCallbackResponse),
        (status = 400, body = ErrorResponse),
        (status = 502, body = ErrorResponse),
    )
)]
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OAuthCallbackRequest>,
) -> Result<Json<OAuthCallbackResponse>, HandlerError> {
    let account = state
        .oauth_flow
        .complete(
            &state.store,
            body.session_id,
            &body.code,
            body.priority.unwrap_or(0),
        )
        .await
        .map_err(to_handler_error)?;
    Ok(Json(OAuthCallbackResponse {
        account: AccountView::from(&account),
    }))
}
