use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use turso::{Builder, Connection, Database};

use crate::error::ProxyError;

/// Global database instance
static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

// ---------------------------------------------------------------------------
// Migration framework
// ---------------------------------------------------------------------------

type MigrationFn =
    fn(&Connection) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

/// Ordered list of all migrations. Each migration assumes all prior migrations
/// have already been applied. New migrations are appended at the end; columns
/// are only ever added with safe defaults, destructive changes rewrite the
/// table and its indexes.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema: accounts, requests, request_payloads, api_keys, oauth_sessions",
        migrate: migrate_v1,
    },
    Migration {
        version: 2,
        description: "add runtime_config table",
        migrate: migrate_v2,
    },
];

/// Read the current schema version (0 if table is empty or doesn't exist yet).
async fn get_schema_version(conn: &Connection) -> Result<i64, ProxyError> {
    let mut rows = conn
        .query("SELECT version FROM schema_version LIMIT 1", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to read schema version: {e}")))?;
    let version = rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);
    Ok(version)
}

/// Set the schema version (insert or update the single row).
async fn set_schema_version(conn: &Connection, version: i64) -> Result<(), ProxyError> {
    conn.execute("DELETE FROM schema_version", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to clear schema version: {e}")))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        (version,),
    )
    .await
    .map_err(|e| ProxyError::Database(format!("Failed to set schema version: {e}")))?;
    Ok(())
}

/// Run all pending migrations.
async fn run_migrations(conn: &Connection, db_path: &Path) -> Result<(), ProxyError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        (),
    )
    .await
    .map_err(|e| ProxyError::Database(format!("Failed to create schema_version table: {e}")))?;

    let mut current = get_schema_version(conn).await?;

    // Back up the database before running any pending migrations
    let has_pending = MIGRATIONS.iter().any(|m| m.version > current);
    if has_pending && current > 0 && db_path.exists() {
        let backup_name = format!(
            "{}.backup-v{}",
            db_path.file_name().unwrap_or_default().to_string_lossy(),
            current
        );
        let backup_path = db_path.with_file_name(&backup_name);
        std::fs::copy(db_path, &backup_path).map_err(|e| {
            ProxyError::Database(format!("Failed to backup database before migration: {e}"))
        })?;
        // Also copy WAL file if present (contains recent uncommitted writes)
        let wal_path = db_path.with_extension("db-wal");
        if wal_path.exists() {
            let wal_backup = db_path.with_file_name(format!("{backup_name}-wal"));
            let _ = std::fs::copy(&wal_path, &wal_backup);
        }
        info!("Database backup created at {}", backup_path.display());
    }

    for migration in MIGRATIONS {
        if migration.version > current {
            info!(
                "Running migration v{}: {}",
                migration.version, migration.description
            );
            (migration.migrate)(conn).await?;
            set_schema_version(conn, migration.version).await?;
            current = migration.version;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Migration v1 — initial schema
// ---------------------------------------------------------------------------

fn migrate_v1(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                refresh_token TEXT,
                access_token TEXT,
                expires_at INTEGER,
                api_key TEXT,
                custom_endpoint TEXT,
                model_mappings TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                tier INTEGER NOT NULL DEFAULT 1,
                paused INTEGER NOT NULL DEFAULT 0,
                auto_fallback_enabled INTEGER NOT NULL DEFAULT 0,
                auto_refresh_enabled INTEGER NOT NULL DEFAULT 0,
                rate_limited_until INTEGER,
                rate_limit_remaining INTEGER,
                rate_limit_reset INTEGER,
                rate_limit_status TEXT,
                session_start INTEGER,
                session_request_count INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                total_requests INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create accounts table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                account_used TEXT,
                status_code INTEGER,
                success INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                response_time_ms INTEGER,
                failover_attempts INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER,
                cache_read_input_tokens INTEGER,
                cache_creation_input_tokens INTEGER,
                total_tokens INTEGER,
                cost_usd REAL,
                output_tokens_per_second REAL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create requests table: {e}")))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp)",
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create requests index: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS request_payloads (
                id TEXT PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
                json TEXT NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            ProxyError::Database(format!("Failed to create request_payloads table: {e}"))
        })?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                hashed_key TEXT NOT NULL,
                prefix_last_8 TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'api-only',
                is_active INTEGER NOT NULL DEFAULT 1,
                usage_count INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create api_keys table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_sessions (
                id TEXT PRIMARY KEY,
                account_name TEXT NOT NULL,
                verifier TEXT NOT NULL,
                mode TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create oauth_sessions table: {e}")))?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Migration v2 — runtime-mutable config
// ---------------------------------------------------------------------------

fn migrate_v2(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS runtime_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to create runtime_config table: {e}")))?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Initialize the database and run all pending migrations.
pub async fn init_db(path: &Path) -> Result<(), ProxyError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ProxyError::Database(format!("Failed to create DB directory: {e}")))?;
    }

    let path_str = path.to_str().unwrap_or("better-ccflare.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to open database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| ProxyError::Database(format!("Failed to connect: {e}")))?;

    // WAL journaling plus incremental auto-vacuum so retention can reclaim
    // pages in bounded steps. journal_mode reports the resulting mode as a
    // row, so it goes through query.
    conn.query("PRAGMA journal_mode = WAL", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to enable WAL: {e}")))?;
    conn.execute("PRAGMA auto_vacuum = INCREMENTAL", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to set auto_vacuum: {e}")))?;
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to enable foreign keys: {e}")))?;

    run_migrations(&conn, path).await?;

    DATABASE
        .set(Arc::new(db))
        .map_err(|_| ProxyError::Database("Database already initialized".into()))?;

    info!("Database initialized at {}", path_str);
    Ok(())
}

/// Get a database connection with foreign keys enabled.
pub async fn get_conn() -> Result<Connection, ProxyError> {
    let db = DATABASE
        .get()
        .ok_or_else(|| ProxyError::Database("Database not initialized".into()))?;
    let conn = db
        .connect()
        .map_err(|e| ProxyError::Database(format!("Failed to get connection: {e}")))?;
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to enable foreign keys: {e}")))?;
    Ok(conn)
}
