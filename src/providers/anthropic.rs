//! Anthropic adapters: OAuth (Bearer access token) and console key
//! (`x-api-key`). Both speak the Messages API natively, so responses pass
//! through untranslated.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{
    InboundRequest, OutboundRequest, Provider, RateLimitSignal, RefreshFuture, RefreshedTokens,
    TokenUsage, model_map, parse_retry_after,
};
use crate::accounts::{Account, ProviderKind};
use crate::constants::{
    ANTHROPIC_API_BASE, ANTHROPIC_CLIENT_ID, ANTHROPIC_TOKEN_URL, ANTHROPIC_VERSION,
    OAUTH_BETA_HEADER, TOKEN_REFRESH_TIMEOUT_SECS,
};
use crate::error::ProxyError;
use crate::store::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    /// OAuth access token: `authorization: Bearer` plus the OAuth beta header
    Oauth,
    /// Console API key: `x-api-key`
    ConsoleKey,
    /// Plain bearer API key against an Anthropic-schema endpoint
    Bearer,
}

pub struct AnthropicProvider {
    auth: AuthStyle,
}

impl AnthropicProvider {
    pub const fn oauth() -> Self {
        Self {
            auth: AuthStyle::Oauth,
        }
    }

    pub const fn console() -> Self {
        Self {
            auth: AuthStyle::ConsoleKey,
        }
    }

    pub const fn bearer() -> Self {
        Self {
            auth: AuthStyle::Bearer,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Pull token counts out of one usage object.
fn usage_from_object(usage: &Value) -> TokenUsage {
    let get = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_input_tokens: get("cache_read_input_tokens"),
        cache_creation_input_tokens: get("cache_creation_input_tokens"),
        partial: false,
    }
}

impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        match self.auth {
            AuthStyle::Oauth => ProviderKind::AnthropicOauth,
            AuthStyle::ConsoleKey => ProviderKind::AnthropicConsoleKey,
            AuthStyle::Bearer => ProviderKind::OtherApiKey,
        }
    }

    fn prepare_request(
        &self,
        inbound: &InboundRequest,
        account: &Account,
        credential: &str,
    ) -> Result<OutboundRequest, ProxyError> {
        let base = account
            .custom_endpoint
            .as_deref()
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/');
        let url = format!("{base}{}", inbound.path);

        // Bodyless requests (GET /v1/models and friends) skip model mapping
        let model = match inbound.model() {
            Some(inbound_model) => model_map::map_model(
                account.model_mappings.as_ref(),
                inbound_model,
                self.kind(),
            ),
            None if inbound.method.eq_ignore_ascii_case("GET") => String::new(),
            None => return Err(ProxyError::Validation("missing model field".into())),
        };

        let mut body = inbound.body.clone();
        if !model.is_empty()
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("model".to_string(), Value::String(model.clone()));
        }

        let mut headers: Vec<(&'static str, String)> = vec![
            ("content-type", "application/json".to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            (
                "accept",
                if inbound.stream {
                    "text/event-stream".to_string()
                } else {
                    "application/json".to_string()
                },
            ),
        ];
        match self.auth {
            AuthStyle::Oauth => {
                headers.push(("authorization", format!("Bearer {credential}")));
                headers.push(("anthropic-beta", OAUTH_BETA_HEADER.to_string()));
            }
            AuthStyle::ConsoleKey => headers.push(("x-api-key", credential.to_string())),
            AuthStyle::Bearer => headers.push(("authorization", format!("Bearer {credential}"))),
        }

        Ok(OutboundRequest {
            url,
            headers,
            body,
            model,
        })
    }

    fn parse_usage(&self, frame: &Value) -> TokenUsage {
        // message_start carries usage under message.usage; message_delta and
        // non-streaming bodies carry it at the top level.
        let mut usage = TokenUsage::default();
        if let Some(u) = frame.get("message").and_then(|m| m.get("usage")) {
            usage.merge(&usage_from_object(u));
        }
        if let Some(u) = frame.get("usage") {
            usage.merge(&usage_from_object(u));
        }
        usage
    }

    fn parse_rate_limit(
        &self,
        headers: &reqwest::header::HeaderMap,
        _status: u16,
    ) -> RateLimitSignal {
        let header_str =
            |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

        let status = header_str("anthropic-ratelimit-unified-status").map(String::from);
        let remaining =
            header_str("anthropic-ratelimit-unified-remaining").and_then(|s| s.parse().ok());
        // Unified reset is epoch seconds
        let reset_at = header_str("anthropic-ratelimit-unified-reset")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs * 1000);

        RateLimitSignal {
            remaining,
            reset_at,
            retry_after_ms: parse_retry_after(headers),
            status,
        }
    }

    fn refresh_token<'a>(&'a self, client: &'a Client, account: &'a Account) -> RefreshFuture<'a> {
        Box::pin(async move {
            if self.auth != AuthStyle::Oauth {
                return Err(ProxyError::OAuth(
                    "provider does not support token refresh".into(),
                ));
            }
            let refresh = account.refresh_token.as_deref().ok_or_else(|| {
                ProxyError::OAuth(format!("account {} has no refresh token", account.name))
            })?;

            let body = serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh,
                "client_id": ANTHROPIC_CLIENT_ID,
            });

            let response = client
                .post(ANTHROPIC_TOKEN_URL)
                .timeout(Duration::from_secs(TOKEN_REFRESH_TIMEOUT_SECS))
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ProxyError::OAuth(format!("token refresh request failed: {e}")))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(ProxyError::OAuth(format!(
                    "token refresh failed ({status}): {text}"
                )));
            }

            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| ProxyError::OAuth(format!("bad token response: {e}")))?;

            Ok(RefreshedTokens {
                access_token: token.access_token,
                expires_at: now_millis() + token.expires_in * 1000,
                refresh_token: token.refresh_token,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::test_account;

    #[test]
    fn test_prepare_request_oauth_headers() {
        let account = test_account("a", ProviderKind::AnthropicOauth);
        let inbound = InboundRequest {
            method: "POST".into(),
            path: "/v1/messages".into(),
            body: serde_json::json!({"model": "claude-sonnet-4-5", "max_tokens": 16}),
            stream: true,
        };
        let provider = AnthropicProvider::oauth();
        let out = provider
            .prepare_request(&inbound, &account, "tok-123")
            .unwrap();

        assert_eq!(out.url, "https://api.anthropic.com/v1/messages");
        assert!(
            out.headers
                .iter()
                .any(|(k, v)| *k == "authorization" && v == "Bearer tok-123")
        );
        assert!(out.headers.iter().all(|(k, _)| *k != "x-api-key"));
        assert_eq!(out.body["model"], "claude-sonnet-4-5");
    }

    #[test]
    fn test_prepare_request_console_key_and_custom_endpoint() {
        let mut account = test_account("a", ProviderKind::AnthropicConsoleKey);
        account.custom_endpoint = Some("https://gateway.example.com/".into());
        let inbound = InboundRequest {
            method: "POST".into(),
            path: "/v1/messages".into(),
            body: serde_json::json!({"model": "sonnet"}),
            stream: false,
        };
        let provider = AnthropicProvider::console();
        let out = provider.prepare_request(&inbound, &account, "sk-key").unwrap();

        assert_eq!(out.url, "https://gateway.example.com/v1/messages");
        assert!(
            out.headers
                .iter()
                .any(|(k, v)| *k == "x-api-key" && v == "sk-key")
        );
        assert!(out.headers.iter().all(|(k, _)| *k != "authorization"));
        // Bare alias resolved through the built-in default mapping
        assert_eq!(out.model, "claude-sonnet-4-5");
    }

    #[test]
    fn test_parse_usage_message_start_and_deltas() {
        let provider = AnthropicProvider::oauth();

        // message_start seeds output_tokens at 1; deltas carry the running
        // total. The merged result must not over-count.
        let start = serde_json::json!({
            "type": "message_start",
            "message": {"usage": {"input_tokens": 10, "cache_read_input_tokens": 3, "output_tokens": 1}}
        });
        let mid = serde_json::json!({
            "type": "message_delta",
            "usage": {"output_tokens": 7}
        });
        let last = serde_json::json!({
            "type": "message_delta",
            "usage": {"output_tokens": 20}
        });

        let mut usage = provider.parse_usage(&start);
        usage.merge(&provider.parse_usage(&mid));
        usage.merge(&provider.parse_usage(&last));
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_input_tokens, 3);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn test_parse_usage_tolerates_garbage() {
        let provider = AnthropicProvider::oauth();
        assert_eq!(
            provider.parse_usage(&serde_json::json!("not an object")),
            TokenUsage::default()
        );
        assert_eq!(
            provider.parse_usage(&serde_json::json!({"usage": {"input_tokens": "NaN"}})),
            TokenUsage::default()
        );
    }

    #[test]
    fn test_parse_rate_limit_unified_headers() {
        let provider = AnthropicProvider::oauth();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("anthropic-ratelimit-unified-status", "rejected".parse().unwrap());
        headers.insert("anthropic-ratelimit-unified-remaining", "0".parse().unwrap());
        headers.insert("anthropic-ratelimit-unified-reset", "1700000000".parse().unwrap());
        headers.insert("retry-after", "30".parse().unwrap());

        let sig = provider.parse_rate_limit(&headers, 429);
        assert_eq!(sig.status.as_deref(), Some("rejected"));
        assert_eq!(sig.remaining, Some(0));
        assert_eq!(sig.reset_at, Some(1_700_000_000_000));
        assert_eq!(sig.retry_after_ms, Some(30_000));
        assert!(sig.is_limited(429));
    }

    #[test]
    fn test_parse_rate_limit_missing_headers() {
        let provider = AnthropicProvider::oauth();
        let headers = reqwest::header::HeaderMap::new();
        let sig = provider.parse_rate_limit(&headers, 200);
        assert_eq!(sig, RateLimitSignal::default());
    }
}
