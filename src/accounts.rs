use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants::TOKEN_REFRESH_MARGIN_MS;

/// Upstream credential flavor. Determines request shaping, auth header
/// injection, and whether session-window tracking applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    AnthropicOauth,
    AnthropicConsoleKey,
    OpenaiCompatible,
    OtherApiKey,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AnthropicOauth => "anthropic-oauth",
            ProviderKind::AnthropicConsoleKey => "anthropic-console-key",
            ProviderKind::OpenaiCompatible => "openai-compatible",
            ProviderKind::OtherApiKey => "other-api-key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic-oauth" => Some(ProviderKind::AnthropicOauth),
            "anthropic-console-key" => Some(ProviderKind::AnthropicConsoleKey),
            "openai-compatible" => Some(ProviderKind::OpenaiCompatible),
            "other-api-key" => Some(ProviderKind::OtherApiKey),
            _ => None,
        }
    }

    /// Whether this provider enforces a fixed-duration usage window that the
    /// selector tracks with a sticky session.
    pub fn tracks_session(&self) -> bool {
        matches!(self, ProviderKind::AnthropicOauth)
    }

    pub fn uses_oauth(&self) -> bool {
        matches!(self, ProviderKind::AnthropicOauth)
    }
}

/// One upstream credential with its pool state. Read-mostly snapshot:
/// mutations go through Store mutators, never through cached copies.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,

    // Credentials: exactly one of {oauth fields, api_key} is present
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<u64>,
    pub api_key: Option<String>,

    pub custom_endpoint: Option<String>,
    pub model_mappings: Option<HashMap<String, String>>,

    // Routing
    pub priority: i64,
    /// Subscription tier multiplier (1x, 5x, 20x), informational
    pub tier: i64,
    pub paused: bool,
    pub auto_fallback_enabled: bool,
    pub auto_refresh_enabled: bool,

    // Rate-limit state
    pub rate_limited_until: Option<u64>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_reset: Option<u64>,
    pub rate_limit_status: Option<String>,

    // Session state (session-tracking providers only)
    pub session_start: Option<u64>,
    pub session_request_count: i64,

    // Counters
    pub request_count: i64,
    pub total_requests: i64,
    pub last_used: Option<u64>,
    pub created_at: u64,
}

impl Account {
    /// Availability predicate: not paused and not inside a rate-limit window.
    pub fn is_available(&self, now: u64) -> bool {
        !self.paused && self.rate_limited_until.is_none_or(|until| until <= now)
    }

    /// Whether the sticky session window has lapsed (or never started).
    pub fn session_expired(&self, now: u64, session_duration_ms: u64) -> bool {
        match self.session_start {
            Some(start) => now.saturating_sub(start) >= session_duration_ms,
            None => true,
        }
    }

    /// Whether the stored access token is missing or within the refresh margin.
    pub fn needs_token_refresh(&self, now: u64) -> bool {
        match (&self.access_token, self.access_token_expires_at) {
            (Some(_), Some(expires)) => expires.saturating_sub(now) <= TOKEN_REFRESH_MARGIN_MS,
            _ => true,
        }
    }
}

/// Redacted account view for admin endpoints. Credentials never serialize.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: Uuid,
    pub name: String,
    pub provider: &'static str,
    pub has_custom_endpoint: bool,
    pub priority: i64,
    pub tier: i64,
    pub paused: bool,
    pub auto_fallback_enabled: bool,
    pub auto_refresh_enabled: bool,
    pub rate_limited_until: Option<u64>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_reset: Option<u64>,
    pub rate_limit_status: Option<String>,
    pub session_start: Option<u64>,
    pub session_request_count: i64,
    pub request_count: i64,
    pub total_requests: i64,
    pub last_used: Option<u64>,
    pub created_at: u64,
}

impl From<&Account> for AccountView {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            provider: a.provider.as_str(),
            has_custom_endpoint: a.custom_endpoint.is_some(),
            priority: a.priority,
            tier: a.tier,
            paused: a.paused,
            auto_fallback_enabled: a.auto_fallback_enabled,
            auto_refresh_enabled: a.auto_refresh_enabled,
            rate_limited_until: a.rate_limited_until,
            rate_limit_remaining: a.rate_limit_remaining,
            rate_limit_reset: a.rate_limit_reset,
            rate_limit_status: a.rate_limit_status.clone(),
            session_start: a.session_start,
            session_request_count: a.session_request_count,
            request_count: a.request_count,
            total_requests: a.total_requests,
            last_used: a.last_used,
            created_at: a.created_at,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_account(name: &str, provider: ProviderKind) -> Account {
    Account {
        id: Uuid::new_v4(),
        name: name.to_string(),
        provider,
        refresh_token: provider.uses_oauth().then(|| "refresh".to_string()),
        access_token: Some("access".to_string()),
        access_token_expires_at: Some(u64::MAX),
        api_key: (!provider.uses_oauth()).then(|| "key".to_string()),
        custom_endpoint: None,
        model_mappings: None,
        priority: 0,
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
        created_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        assert!(a.is_available(1000));

        a.rate_limited_until = Some(2000);
        assert!(!a.is_available(1000));
        assert!(a.is_available(2000));

        a.paused = true;
        assert!(!a.is_available(5000));
    }

    #[test]
    fn test_session_expiry() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        assert!(a.session_expired(1000, 100));

        a.session_start = Some(950);
        assert!(!a.session_expired(1000, 100));
        assert!(a.session_expired(1050, 100));
    }
}
