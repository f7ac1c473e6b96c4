mod accounts;
mod api_keys;
mod config;
mod constants;
mod db;
mod dispatcher;
mod error;
mod gate;
mod jobs;
mod oauth;
mod pricing;
mod providers;
mod routes;
mod scheduler;
mod selector;
mod store;
mod streaming;
mod token_manager;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{any, get},
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use reqwest::Client;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_axum::{router::OpenApiRouter, routes};
use uuid::Uuid;

use api_keys::ApiKeyStore;
use config::{Config, CorsMode, LogFormat, RuntimeConfig};
use constants::UPSTREAM_TIMEOUT_SECS;
use dispatcher::{DispatchOptions, Dispatcher};
use jobs::UsageWindowSnapshot;
use oauth::OAuthFlow;
use pricing::PricingCatalog;
use scheduler::IntervalManager;
use store::Store;
use token_manager::TokenManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config: Config,
    pub runtime: RwLock<RuntimeConfig>,
    pub store: Arc<Store>,
    pub tokens: Arc<TokenManager>,
    pub pricing: Arc<PricingCatalog>,
    pub api_keys: Arc<ApiKeyStore>,
    pub dispatcher: Dispatcher,
    pub oauth_flow: OAuthFlow,
    pub intervals: IntervalManager,
    /// Usage-window utilization per account, maintained by the poller
    pub usage_windows: RwLock<HashMap<Uuid, UsageWindowSnapshot>>,
    pub http_client: Client,
}

impl AppState {
    /// Snapshot the runtime-mutable knobs for one dispatch.
    pub async fn dispatch_options(&self) -> DispatchOptions {
        let runtime = self.runtime.read().await;
        DispatchOptions {
            retry_attempts: runtime.retry_attempts,
            retry_delay_ms: runtime.retry_delay_ms,
            retry_backoff: runtime.retry_backoff,
            session_duration_ms: runtime.session_duration_ms,
            capture_payloads: runtime.capture_payloads,
        }
    }

    /// Stop the scheduler loops first, then drain the write queue.
    pub async fn shutdown(&self) {
        self.intervals.shutdown();
        self.store.shutdown(Duration::from_secs(5)).await;
    }
}

#[derive(Parser)]
#[command(name = "better-ccflare")]
#[command(about = "Load-balancing reverse proxy for Anthropic-compatible LLM APIs")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let writer = config.log_dir.as_ref().and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("better-ccflare.log"))
            .ok()
    });

    match (config.log_format, writer) {
        (LogFormat::Json, Some(file)) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init(),
        (LogFormat::Json, None) => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        (LogFormat::Pretty, Some(file)) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init(),
        (LogFormat::Pretty, None) => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn build_cors(mode: &CorsMode) -> CorsLayer {
    let cors_mode = mode.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };
            match &cors_mode {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ])
        .allow_credentials(true)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_env();
    init_tracing(&config);

    db::init_db(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let host = args.host.clone().unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // Shared HTTP client with connection pooling. Streams stay open as long
    // as bytes keep arriving; the read timeout bounds idle gaps only.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let store = Arc::new(Store::new());
    let tokens = Arc::new(TokenManager::new(http_client.clone(), Arc::clone(&store)));
    let pricing = Arc::new(PricingCatalog::new());
    let dispatcher = Dispatcher {
        store: Arc::clone(&store),
        tokens: Arc::clone(&tokens),
        pricing: Arc::clone(&pricing),
        client: http_client.clone(),
    };

    let runtime = RuntimeConfig::from_config(&config);
    let state = Arc::new(AppState {
        runtime: RwLock::new(runtime),
        store,
        tokens,
        pricing,
        api_keys: Arc::new(ApiKeyStore::new()),
        dispatcher,
        oauth_flow: OAuthFlow::new(http_client.clone()),
        intervals: IntervalManager::new(),
        usage_windows: RwLock::new(HashMap::new()),
        http_client,
        config,
    });

    routes::admin::load_runtime_overrides(&state).await;
    jobs::register_jobs(Arc::clone(&state));

    match &state.config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    // Admin API routes with OpenAPI spec generation
    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        // Accounts
        .routes(routes!(
            routes::admin::list_accounts,
            routes::admin::create_account
        ))
        .routes(routes!(routes::admin::delete_account))
        .routes(routes!(routes::admin::set_priority))
        .routes(routes!(routes::admin::set_tier))
        .routes(routes!(routes::admin::set_auto_fallback))
        .routes(routes!(routes::admin::set_custom_endpoint))
        .routes(routes!(routes::admin::pause_account))
        .routes(routes!(routes::admin::resume_account))
        // API keys
        .routes(routes!(
            routes::admin::list_api_keys,
            routes::admin::create_api_key
        ))
        .routes(routes!(routes::admin::delete_api_key))
        .routes(routes!(routes::admin::enable_api_key))
        .routes(routes!(routes::admin::disable_api_key))
        // Stats
        .routes(routes!(routes::admin::stats))
        .routes(routes!(routes::admin::recent_requests))
        .routes(routes!(routes::admin::request_payload))
        .routes(routes!(routes::admin::analytics))
        // Config
        .routes(routes!(
            routes::admin::get_config,
            routes::admin::patch_config
        ))
        .routes(routes!(
            routes::admin::get_strategy,
            routes::admin::set_strategy
        ))
        // OAuth onboarding
        .routes(routes!(routes::admin::oauth_init))
        .routes(routes!(routes::admin::oauth_callback))
        .split_for_parts();

    let swagger = utoipa_swagger_ui::SwaggerUi::new("/swagger")
        .url("/api-docs/openapi.json", openapi);

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .route("/v1/{*rest}", any(routes::proxy::proxy))
            .merge(api_router)
            .merge(swagger)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                gate::gate_middleware,
            ))
            .layer(build_cors(&state.config.cors_mode))
            .with_state(Arc::clone(&state)),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting better-ccflare v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );

    match state.config.tls_paths() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert.clone(), key.clone())
                .await
                .expect("Failed to load TLS certificate or key");
            info!("Listening on https://{}", addr);

            let handle = Handle::new();
            let shutdown_handle = handle.clone();
            let shutdown_state = Arc::clone(&state);
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
                shutdown_state.shutdown().await;
            });

            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(ServiceExt::<axum::extract::Request>::into_make_service(app))
                .await
                .expect("Server error");
        }
        None => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .expect("Failed to bind");
            let serve_state = Arc::clone(&state);
            axum::serve(
                listener,
                ServiceExt::<axum::extract::Request>::into_make_service(app),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("Server error");
            serve_state.shutdown().await;
        }
    }

    info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
    }
}
