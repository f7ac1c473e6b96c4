use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Missing API key: provide x-api-key or Authorization: Bearer")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Forbidden: this key cannot access {0}")]
    Forbidden(String),

    #[error("OAuth token refresh failed for account {account}: {reason}")]
    AuthRefreshFailed { account: String, reason: String },

    #[error("All accounts are rate limited; retry after {retry_after_secs}s")]
    AllRateLimited { retry_after_secs: u64 },

    #[error("No available accounts")]
    NoAccountsAvailable,

    #[error("All upstream attempts failed: {0}")]
    UpstreamExhausted(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error")]
    Internal,
}

impl ProxyError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::MissingApiKey | ProxyError::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "authentication_error")
            }
            ProxyError::Forbidden(_) => (StatusCode::FORBIDDEN, "permission_error"),
            ProxyError::AllRateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error")
            }
            ProxyError::NoAccountsAvailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
            }
            ProxyError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ProxyError::AuthRefreshFailed { .. }
            | ProxyError::UpstreamExhausted(_)
            | ProxyError::Network(_) => (StatusCode::BAD_GATEWAY, "api_error"),
            ProxyError::Database(_)
            | ProxyError::OAuth(_)
            | ProxyError::Io(_)
            | ProxyError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
        }
    }

    /// Anthropic-shape error body. Internal details never leak: database,
    /// IO, and panic-class errors get a generic message.
    pub fn to_response(&self) -> Response {
        let (status, error_type) = self.status_and_kind();

        let message = match self {
            ProxyError::Database(_) | ProxyError::Io(_) | ProxyError::Internal => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": message
                }
            })),
        )
            .into_response();

        if let ProxyError::AllRateLimited { retry_after_secs } = self
            && let Ok(value) = retry_after_secs.to_string().parse()
        {
            response.headers_mut().insert("retry-after", value);
        }

        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_sanitized() {
        let err = ProxyError::Database("secret path /var/db leaked".into());
        let (status, kind) = err.status_and_kind();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(kind, "api_error");
    }

    #[test]
    fn test_rate_limit_maps_to_429() {
        let err = ProxyError::AllRateLimited {
            retry_after_secs: 30,
        };
        let (status, kind) = err.status_and_kind();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(kind, "rate_limit_error");
    }

    #[test]
    fn test_capacity_maps_to_503() {
        let (status, _) = ProxyError::NoAccountsAvailable.status_and_kind();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
