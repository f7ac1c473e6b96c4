/// Anthropic API base for proxied requests
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

/// Anthropic OAuth token endpoint
pub const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// Anthropic OAuth authorize endpoint
pub const ANTHROPIC_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";

/// Anthropic OAuth redirect URI (manual code-paste flow)
pub const ANTHROPIC_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Anthropic OAuth client id (Claude Code public client)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Anthropic OAuth scopes
pub const ANTHROPIC_SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Anthropic API URL for subscription usage (OAuth accounts)
pub const ANTHROPIC_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// OAuth beta features header value
pub const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";

/// Issued inbound API keys: literal prefix + 32 base62 chars
pub const API_KEY_PREFIX: &str = "btr-";
pub const API_KEY_RANDOM_LEN: usize = 32;

/// Per-request header that suppresses sticky-session selection.
/// Set by the session auto-refresh job on its synthetic requests.
pub const SESSION_BYPASS_HEADER: &str = "x-ccflare-refresh";

/// Fixed-duration usage window for session-tracking providers (5h)
pub const DEFAULT_SESSION_DURATION_MS: u64 = 5 * 60 * 60 * 1000;

/// Access-token refresh safety margin
pub const TOKEN_REFRESH_MARGIN_MS: u64 = 60_000;

/// Token refresh HTTP timeout
pub const TOKEN_REFRESH_TIMEOUT_SECS: u64 = 15;

/// Per-attempt upstream timeout (idle)
pub const UPSTREAM_TIMEOUT_SECS: u64 = 60;

/// Async write queue capacity; overflow drops the newest job
pub const WRITE_QUEUE_CAP: usize = 10_000;

/// Capture ceiling for SSE usage scanning
pub const STREAM_CAPTURE_CAP: usize = 32 * 1024;

/// Absolute capture ceiling for non-streaming JSON bodies
pub const BODY_CAPTURE_CAP: usize = 1024 * 1024;

/// Retention sweep interval (also runs at startup)
pub const RETENTION_INTERVAL_MS: u64 = 6 * 60 * 60 * 1000;

/// Usage poller interval per OAuth account
pub const USAGE_POLL_INTERVAL_MS: u64 = 60_000;

/// Bounded page reclamation after retention deletes
pub const INCREMENTAL_VACUUM_PAGES: u64 = 1000;

/// Built-in model mapping for providers that require a concrete upstream id.
/// Accounts with native Anthropic model support pass through unchanged.
/// Format: (short token, upstream model id)
pub static DEFAULT_MODEL_MAPPINGS: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-5"),
    ("sonnet", "claude-sonnet-4-5"),
    ("haiku", "claude-haiku-4-5"),
];

/// Seed pricing for the catalog, $/MTok.
/// Format: (id, input_price, output_price, cache_read_price, cache_write_price)
pub static SEED_PRICING: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4-5", 5.0, 25.0, 0.50, 6.25),
    ("claude-sonnet-4-5", 3.0, 15.0, 0.30, 3.75),
    ("claude-haiku-4-5", 1.0, 5.0, 0.10, 1.25),
    ("claude-opus-4-1", 15.0, 75.0, 1.50, 18.75),
    ("claude-sonnet-4-0", 3.0, 15.0, 0.30, 3.75),
    ("gpt-4o", 2.5, 10.0, 1.25, 0.0),
    ("gpt-4o-mini", 0.15, 0.60, 0.075, 0.0),
];
