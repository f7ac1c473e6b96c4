//! Provider adapters. Upstream differences collapse to the [`Provider`]
//! trait; a small registry hands out the adapter for an account's kind.

pub mod anthropic;
pub mod model_map;
pub mod openai;

use std::future::Future;
use std::pin::Pin;

use reqwest::Client;
use serde_json::Value;

use crate::accounts::{Account, ProviderKind};
use crate::error::ProxyError;

/// Token counts extracted from a response. Missing fields stay zero;
/// `partial` marks extraction that hit the capture cap or malformed input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub partial: bool,
}

impl TokenUsage {
    /// Fold in usage observed in another frame. Streamed counts are
    /// cumulative (`message_start` seeds `output_tokens`, each
    /// `message_delta` reports the running total), so every field keeps the
    /// largest value seen rather than summing.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(other.cache_read_input_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(other.cache_creation_input_tokens);
        self.partial |= other.partial;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Normalized rate-limit signal from upstream headers and status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSignal {
    pub remaining: Option<i64>,
    /// Epoch ms when the provider's usage window resets.
    pub reset_at: Option<u64>,
    /// Milliseconds to back off, from `retry-after`.
    pub retry_after_ms: Option<u64>,
    pub status: Option<String>,
}

impl RateLimitSignal {
    /// Whether the signal says the account is currently rejected.
    pub fn is_limited(&self, status_code: u16) -> bool {
        status_code == 429 || self.status.as_deref() == Some("rejected")
    }

    /// Absolute end of the back-off window, preferring `retry-after` over
    /// the provider's announced reset.
    pub fn limited_until(&self, now: u64) -> Option<u64> {
        self.retry_after_ms
            .map(|ms| now + ms)
            .or(self.reset_at)
    }
}

/// Fresh tokens from the provider's OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub expires_at: u64,
    pub refresh_token: Option<String>,
}

/// Request descriptor handed to the dispatcher. Providers construct this
/// without performing IO, which keeps request shaping testable.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
    /// The model id sent upstream after mapping.
    pub model: String,
}

/// Inbound request view passed to `prepare_request`.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
    pub stream: bool,
}

impl InboundRequest {
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|m| m.as_str())
    }
}

/// Stateful translator for streaming responses that are not already in the
/// Anthropic event shape. Lives only for the duration of one pipe.
pub trait StreamTranslator: Send {
    /// Translate one upstream SSE data frame into zero or more outbound SSE
    /// messages (already `data: ...\n\n` framed).
    fn translate(&mut self, frame: &Value) -> Vec<String>;
    /// Emit any closing events once upstream ends.
    fn finish(&mut self) -> Vec<String>;
}

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RefreshedTokens, ProxyError>> + Send + 'a>>;

pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Shape the outbound request: rewrite the target URL (honoring the
    /// account's custom endpoint), apply model mapping, and inject the
    /// outbound auth header. Inbound auth headers are never reused.
    fn prepare_request(
        &self,
        inbound: &InboundRequest,
        account: &Account,
        credential: &str,
    ) -> Result<OutboundRequest, ProxyError>;

    /// Extract token counts from one parsed JSON frame (an SSE data frame or
    /// a whole non-streaming body). Tolerates missing fields; never fails.
    fn parse_usage(&self, frame: &Value) -> TokenUsage;

    /// Normalize rate-limit headers for the store.
    fn parse_rate_limit(&self, headers: &reqwest::header::HeaderMap, status: u16)
    -> RateLimitSignal;

    /// OAuth token refresh. Default: unsupported.
    fn refresh_token<'a>(&'a self, _client: &'a Client, _account: &'a Account) -> RefreshFuture<'a> {
        Box::pin(async {
            Err(ProxyError::OAuth(
                "provider does not support token refresh".into(),
            ))
        })
    }

    /// Translator for response bodies that need reshaping to the Anthropic
    /// wire format. `None` means pass-through.
    fn stream_translator(&self, _model: &str) -> Option<Box<dyn StreamTranslator>> {
        None
    }

    /// Translate a whole non-streaming response body. `None` = pass-through.
    fn translate_response(&self, _body: &Value, _model: &str) -> Option<Value> {
        None
    }
}

static ANTHROPIC_OAUTH: anthropic::AnthropicProvider = anthropic::AnthropicProvider::oauth();
static ANTHROPIC_CONSOLE: anthropic::AnthropicProvider = anthropic::AnthropicProvider::console();
static ANTHROPIC_BEARER: anthropic::AnthropicProvider = anthropic::AnthropicProvider::bearer();
static OPENAI_COMPAT: openai::OpenAiCompatProvider = openai::OpenAiCompatProvider::new();

/// Adapter lookup by provider kind.
pub fn provider_for(kind: ProviderKind) -> &'static dyn Provider {
    match kind {
        ProviderKind::AnthropicOauth => &ANTHROPIC_OAUTH,
        ProviderKind::AnthropicConsoleKey => &ANTHROPIC_CONSOLE,
        ProviderKind::OpenaiCompatible => &OPENAI_COMPAT,
        ProviderKind::OtherApiKey => &ANTHROPIC_BEARER,
    }
}

/// Shared header parsing: `retry-after` in seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_merge_keeps_cumulative_maximum() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 1,
            ..Default::default()
        };
        // Two deltas each carrying the running output total
        usage.merge(&TokenUsage {
            output_tokens: 12,
            cache_read_input_tokens: 5,
            ..Default::default()
        });
        usage.merge(&TokenUsage {
            output_tokens: 20,
            ..Default::default()
        });
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_input_tokens, 5);
        assert_eq!(usage.total(), 35);
        assert!(!usage.partial);
    }

    #[test]
    fn test_limited_until_prefers_retry_after() {
        let sig = RateLimitSignal {
            retry_after_ms: Some(30_000),
            reset_at: Some(5_000_000),
            ..Default::default()
        };
        assert_eq!(sig.limited_until(1_000_000), Some(1_030_000));

        let sig = RateLimitSignal {
            reset_at: Some(5_000_000),
            ..Default::default()
        };
        assert_eq!(sig.limited_until(1_000_000), Some(5_000_000));
    }

    #[test]
    fn test_rejected_status_is_limited() {
        let sig = RateLimitSignal {
            status: Some("rejected".into()),
            ..Default::default()
        };
        assert!(sig.is_limited(200));
        assert!(sig.is_limited(429));

        let ok = RateLimitSignal::default();
        assert!(!ok.is_limited(200));
        assert!(ok.is_limited(429));
    }
}
