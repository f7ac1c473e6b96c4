use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

use crate::constants::DEFAULT_SESSION_DURATION_MS;

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for public API deployment with API key auth)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Log output format, selected by LOG_FORMAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub session_duration_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    /// Payload retention window in days
    pub data_retention_days: u32,
    /// Request record retention window in days
    pub request_retention_days: u32,
    pub strategy: String,
    pub cors_mode: CorsMode,
    /// Opt-in request/response payload archiving
    pub capture_payloads: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("BETTER_CCFLARE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT").unwrap_or(8080);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("better-ccflare");

        let log_dir = env::var("BETTER_CCFLARE_LOG_DIR").ok().map(PathBuf::from);

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let tls_key_path = env::var("SSL_KEY_PATH").ok().map(PathBuf::from);
        let tls_cert_path = env::var("SSL_CERT_PATH").ok().map(PathBuf::from);

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("BETTER_CCFLARE_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        Self {
            host,
            port,
            data_dir,
            log_dir,
            log_format,
            tls_key_path,
            tls_cert_path,
            session_duration_ms: env_parse("SESSION_DURATION_MS")
                .unwrap_or(DEFAULT_SESSION_DURATION_MS),
            retry_attempts: env_parse("RETRY_ATTEMPTS").unwrap_or(3),
            retry_delay_ms: env_parse("RETRY_DELAY_MS").unwrap_or(1000),
            retry_backoff: env_parse("RETRY_BACKOFF").unwrap_or(2.0),
            data_retention_days: env_parse("DATA_RETENTION_DAYS").unwrap_or(7),
            request_retention_days: env_parse("REQUEST_RETENTION_DAYS").unwrap_or(30),
            strategy: env::var("STRATEGY").unwrap_or_else(|_| "session".to_string()),
            cors_mode,
            capture_payloads: env::var("CAPTURE_PAYLOADS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("better-ccflare.db")
    }

    /// TLS is enabled iff both the key and certificate paths are set.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub fn payload_retention_ms(&self) -> u64 {
        self.data_retention_days as u64 * 24 * 60 * 60 * 1000
    }

    pub fn request_retention_ms(&self) -> u64 {
        self.request_retention_days as u64 * 24 * 60 * 60 * 1000
    }
}

/// Runtime-mutable subset of the configuration, PATCHable via the admin API.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub session_duration_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub data_retention_days: u32,
    pub request_retention_days: u32,
    pub strategy: String,
    pub capture_payloads: bool,
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_duration_ms: config.session_duration_ms,
            retry_attempts: config.retry_attempts,
            retry_delay_ms: config.retry_delay_ms,
            retry_backoff: config.retry_backoff,
            data_retention_days: config.data_retention_days,
            request_retention_days: config.request_retention_days,
            strategy: config.strategy.clone(),
            capture_payloads: config.capture_payloads,
        }
    }
}
