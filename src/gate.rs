//! Inbound auth gate. Runs before the dispatcher on every request:
//! classifies path exemptions, validates the presented API key against the
//! stored salted hashes, and enforces the key's role.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use crate::AppState;
use crate::api_keys::KeyRole;
use crate::error::ProxyError;

/// Role attached to the request after the gate passes.
#[derive(Debug, Clone, Copy)]
pub struct AuthedRole(pub KeyRole);

/// Paths that bypass authentication entirely: the dashboard root, health,
/// static assets, and the OAuth endpoints needed to bootstrap accounts.
/// Fixed paths are exact-matched; asset patterns check only the final
/// segment so user-supplied deeper paths cannot collide.
pub fn is_exempt(path: &str) -> bool {
    if matches!(path, "/" | "/health" | "/favicon.ico") {
        return true;
    }
    if path.starts_with("/static/") || path.starts_with("/assets/") {
        return true;
    }
    if path.starts_with("/api/oauth/") {
        return true;
    }
    let last = path.rsplit('/').next().unwrap_or("");
    last.starts_with("chunk-") || last.starts_with("favicon-") || last.ends_with(".map")
}

/// Extract the presented key from `x-api-key` or `Authorization: Bearer`
/// (scheme matched case-insensitively).
pub fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, rest) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
        })
}

/// Whether `role` may touch `path` once authenticated. Admin keys pass
/// everywhere; api-only keys are confined to the proxy surface.
pub fn role_allows(role: KeyRole, path: &str) -> bool {
    match role {
        KeyRole::Admin => true,
        KeyRole::ApiOnly => path.starts_with("/v1/") || path == "/v1",
    }
}

pub async fn gate_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(request).await;
    }

    let active = match state.api_keys.active_keys().await {
        Ok(keys) => keys,
        Err(e) => return e.to_response(),
    };

    // No issued keys means authentication is disabled.
    if active.is_empty() {
        return next.run(request).await;
    }

    let Some(presented) = extract_key(request.headers()) else {
        return ProxyError::MissingApiKey.to_response();
    };

    let matched = active
        .iter()
        .find(|k| crate::api_keys::verify_key(&k.hashed_key, presented));
    let Some(key) = matched else {
        return ProxyError::InvalidApiKey.to_response();
    };

    if !role_allows(key.role, &path) {
        return ProxyError::Forbidden(path).to_response();
    }

    state.store.touch_key_used(&key.id);

    let mut request = request;
    request.extensions_mut().insert(AuthedRole(key.role));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt("/"));
        assert!(is_exempt("/health"));
        assert!(is_exempt("/static/app.js"));
        assert!(is_exempt("/assets/logo.svg"));
        assert!(is_exempt("/chunk-abc123.js"));
        assert!(is_exempt("/favicon-32.png"));
        assert!(is_exempt("/static/app.js.map"));
        assert!(is_exempt("/api/oauth/init"));

        assert!(!is_exempt("/v1/messages"));
        assert!(!is_exempt("/api/accounts"));
        assert!(!is_exempt("/api/stats"));
        // Only the final segment matters for asset patterns
        assert!(!is_exempt("/v1/chunk-upload/finish"));
    }

    #[test]
    fn test_extract_key_header_forms() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("btr-abc"));
        assert_eq!(extract_key(&headers), Some("btr-abc"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer btr-xyz"),
        );
        assert_eq!(extract_key(&headers), Some("btr-xyz"));

        // Scheme is case-insensitive
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("bearer btr-low"),
        );
        assert_eq!(extract_key(&headers), Some("btr-low"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xx"));
        assert_eq!(extract_key(&headers), None);

        assert_eq!(extract_key(&HeaderMap::new()), None);
    }

    #[test]
    fn test_role_enforcement() {
        assert!(role_allows(KeyRole::Admin, "/api/accounts"));
        assert!(role_allows(KeyRole::Admin, "/v1/messages"));
        assert!(role_allows(KeyRole::ApiOnly, "/v1/messages"));
        assert!(!role_allows(KeyRole::ApiOnly, "/api/accounts"));
        assert!(!role_allows(KeyRole::ApiOnly, "/api/stats"));
        assert!(!role_allows(KeyRole::ApiOnly, "/api/api-keys"));
        assert!(!role_allows(KeyRole::ApiOnly, "/api/analytics"));
    }
}
