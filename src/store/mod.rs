//! Durable state owner. All account, request, and payload mutations go
//! through here; telemetry writes ride the async queue in [`writer`].

pub mod retention;
pub mod writer;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::debug;
use turso::Row;
use uuid::Uuid;

use crate::accounts::{Account, ProviderKind};
use crate::db;
use crate::error::ProxyError;
use writer::{WriteJob, WriteQueue};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One row per inbound proxied request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: Uuid,
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub account_used: Option<Uuid>,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub failover_attempts: u32,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub output_tokens_per_second: Option<f64>,
}

impl RequestRecord {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            method: method.to_string(),
            path: path.to_string(),
            account_used: None,
            status_code: None,
            success: false,
            error_message: None,
            response_time_ms: None,
            failover_attempts: 0,
            model: None,
            input_tokens: None,
            output_tokens: None,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            total_tokens: None,
            cost_usd: None,
            output_tokens_per_second: None,
        }
    }
}

pub struct Store {
    writer: WriteQueue,
}

impl Store {
    pub fn new() -> Self {
        Self {
            writer: WriteQueue::spawn(),
        }
    }

    // -----------------------------------------------------------------------
    // Account reads
    // -----------------------------------------------------------------------

    pub async fn list_accounts(&self) -> Result<Vec<Account>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY priority, created_at"),
                (),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to list accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Some(account) = row_to_account(&row) {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Option<Account>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"),
                [id.to_string()],
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to get account: {e}")))?;
        Ok(rows.next().await.ok().flatten().and_then(|r| row_to_account(&r)))
    }

    pub async fn get_account_by_name(&self, name: &str) -> Result<Option<Account>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?"),
                [name],
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to get account: {e}")))?;
        Ok(rows.next().await.ok().flatten().and_then(|r| row_to_account(&r)))
    }

    // -----------------------------------------------------------------------
    // Account mutators, idempotent with respect to caller retries
    // -----------------------------------------------------------------------

    pub async fn insert_account(&self, account: &Account) -> Result<(), ProxyError> {
        let conn = db::get_conn().await?;
        conn.execute(
            r#"INSERT INTO accounts (id, name, provider, priority, tier, paused,
                auto_fallback_enabled, auto_refresh_enabled,
                session_request_count, request_count, total_requests, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?)"#,
            (
                account.id.to_string(),
                account.name.as_str(),
                account.provider.as_str(),
                account.priority,
                account.tier,
                account.paused as i64,
                account.auto_fallback_enabled as i64,
                account.auto_refresh_enabled as i64,
                account.created_at as i64,
            ),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to insert account: {e}")))?;

        if let (Some(refresh), Some(access), Some(expires)) = (
            &account.refresh_token,
            &account.access_token,
            account.access_token_expires_at,
        ) {
            conn.execute(
                "UPDATE accounts SET refresh_token = ?, access_token = ?, expires_at = ? WHERE id = ?",
                (
                    refresh.as_str(),
                    access.as_str(),
                    expires as i64,
                    account.id.to_string(),
                ),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to store tokens: {e}")))?;
        }
        if let Some(key) = &account.api_key {
            conn.execute(
                "UPDATE accounts SET api_key = ? WHERE id = ?",
                (key.as_str(), account.id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to store api key: {e}")))?;
        }
        if let Some(endpoint) = &account.custom_endpoint {
            conn.execute(
                "UPDATE accounts SET custom_endpoint = ? WHERE id = ?",
                (endpoint.as_str(), account.id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to store endpoint: {e}")))?;
        }
        if let Some(mappings) = &account.model_mappings {
            let json = serde_json::to_string(mappings).unwrap_or_default();
            conn.execute(
                "UPDATE accounts SET model_mappings = ? WHERE id = ?",
                (json.as_str(), account.id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to store mappings: {e}")))?;
        }
        Ok(())
    }

    pub async fn delete_account(&self, id: Uuid) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute("DELETE FROM accounts WHERE id = ?", [id.to_string()])
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to delete account: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn update_tokens(
        &self,
        id: Uuid,
        access: &str,
        expires_at: u64,
    ) -> Result<(), ProxyError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET access_token = ?, expires_at = ? WHERE id = ?",
            (access, expires_at as i64, id.to_string()),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to update tokens: {e}")))?;
        Ok(())
    }

    pub async fn update_refresh_token(&self, id: Uuid, refresh: &str) -> Result<(), ProxyError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET refresh_token = ? WHERE id = ?",
            (refresh, id.to_string()),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to update refresh token: {e}")))?;
        Ok(())
    }

    /// Record a rate-limit signal. `rate_limited_until` only ever advances;
    /// a stale signal cannot shorten an existing window.
    pub async fn mark_rate_limited(
        &self,
        id: Uuid,
        until: Option<u64>,
        status: Option<&str>,
        remaining: Option<i64>,
        reset: Option<u64>,
    ) -> Result<(), ProxyError> {
        let conn = db::get_conn().await?;
        if let Some(until) = until {
            conn.execute(
                "UPDATE accounts SET rate_limited_until = MAX(COALESCE(rate_limited_until, 0), ?) WHERE id = ?",
                (until as i64, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to mark rate limited: {e}")))?;
        }
        if let Some(status) = status {
            conn.execute(
                "UPDATE accounts SET rate_limit_status = ? WHERE id = ?",
                (status, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set rate limit status: {e}")))?;
        }
        if let Some(remaining) = remaining {
            conn.execute(
                "UPDATE accounts SET rate_limit_remaining = ? WHERE id = ?",
                (remaining, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set remaining: {e}")))?;
        }
        if let Some(reset) = reset {
            conn.execute(
                "UPDATE accounts SET rate_limit_reset = ? WHERE id = ?",
                (reset as i64, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set reset: {e}")))?;
        }
        Ok(())
    }

    /// Clear rate-limit windows that have already lapsed.
    pub async fn clear_expired_rate_limits(&self, now: u64) -> Result<u64, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE accounts SET rate_limited_until = NULL WHERE rate_limited_until IS NOT NULL AND rate_limited_until <= ?",
                (now as i64,),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to clear rate limits: {e}")))?;
        if affected > 0 {
            debug!("Cleared {affected} expired rate-limit windows");
        }
        Ok(affected)
    }

    /// Start a fresh session window: `session_start = now`, counters zeroed.
    pub async fn reset_session(&self, id: Uuid, now: u64) -> Result<(), ProxyError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "UPDATE accounts SET session_start = ?, session_request_count = 0, request_count = 0 WHERE id = ?",
            (now as i64, id.to_string()),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to reset session: {e}")))?;
        Ok(())
    }

    pub async fn set_paused(&self, id: Uuid, paused: bool) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE accounts SET paused = ? WHERE id = ?",
                (paused as i64, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set paused: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_priority(&self, id: Uuid, priority: i64) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE accounts SET priority = ? WHERE id = ?",
                (priority, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set priority: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_tier(&self, id: Uuid, tier: i64) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE accounts SET tier = ? WHERE id = ?",
                (tier, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set tier: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_auto_fallback(&self, id: Uuid, enabled: bool) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE accounts SET auto_fallback_enabled = ? WHERE id = ?",
                (enabled as i64, id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to set auto-fallback: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_custom_endpoint(
        &self,
        id: Uuid,
        endpoint: Option<&str>,
    ) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = match endpoint {
            Some(url) => conn
                .execute(
                    "UPDATE accounts SET custom_endpoint = ? WHERE id = ?",
                    (url, id.to_string()),
                )
                .await,
            None => {
                conn.execute(
                    "UPDATE accounts SET custom_endpoint = NULL WHERE id = ?",
                    [id.to_string()],
                )
                .await
            }
        }
        .map_err(|e| ProxyError::Database(format!("Failed to set endpoint: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_model_mappings(
        &self,
        id: Uuid,
        mappings: Option<&HashMap<String, String>>,
    ) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let affected = match mappings {
            Some(map) => {
                let json = serde_json::to_string(map)
                    .map_err(|e| ProxyError::Database(format!("Bad mappings: {e}")))?;
                conn.execute(
                    "UPDATE accounts SET model_mappings = ? WHERE id = ?",
                    (json.as_str(), id.to_string()),
                )
                .await
            }
            None => {
                conn.execute(
                    "UPDATE accounts SET model_mappings = NULL WHERE id = ?",
                    [id.to_string()],
                )
                .await
            }
        }
        .map_err(|e| ProxyError::Database(format!("Failed to set mappings: {e}")))?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Telemetry writes (queued, never block the caller)
    // -----------------------------------------------------------------------

    pub fn record_request(&self, record: RequestRecord, payload: Option<Value>) {
        let now = record.timestamp;
        self.writer.enqueue(WriteJob::Record { record, payload }, now);
    }

    pub fn touch_account_served(&self, account_id: Uuid, tracks_session: bool) {
        let now = now_millis();
        self.writer.enqueue(
            WriteJob::AccountServed {
                account_id,
                now,
                tracks_session,
            },
            now,
        );
    }

    pub fn touch_key_used(&self, key_id: &str) {
        let now = now_millis();
        self.writer.enqueue(
            WriteJob::KeyUsed {
                key_id: key_id.to_string(),
                now,
            },
            now,
        );
    }

    pub fn dropped_writes(&self) -> u64 {
        self.writer.dropped_count()
    }

    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.writer.shutdown(timeout).await;
    }

    // -----------------------------------------------------------------------
    // Request record reads (admin endpoints)
    // -----------------------------------------------------------------------

    pub async fn recent_requests(&self, limit: u32) -> Result<Vec<Value>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, timestamp, method, path, account_used, status_code, success,
                        error_message, response_time_ms, failover_attempts, model,
                        input_tokens, output_tokens, cache_read_input_tokens,
                        cache_creation_input_tokens, total_tokens, cost_usd,
                        output_tokens_per_second
                 FROM requests ORDER BY timestamp DESC LIMIT ?",
                (limit as i64,),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to list requests: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(serde_json::json!({
                "id": row.get::<String>(0).unwrap_or_default(),
                "timestamp": row.get::<i64>(1).unwrap_or(0),
                "method": row.get::<String>(2).unwrap_or_default(),
                "path": row.get::<String>(3).unwrap_or_default(),
                "accountUsed": row.get::<Option<String>>(4).ok().flatten(),
                "statusCode": row.get::<Option<i64>>(5).ok().flatten(),
                "success": row.get::<i64>(6).unwrap_or(0) != 0,
                "errorMessage": row.get::<Option<String>>(7).ok().flatten(),
                "responseTimeMs": row.get::<Option<i64>>(8).ok().flatten(),
                "failoverAttempts": row.get::<i64>(9).unwrap_or(0),
                "model": row.get::<Option<String>>(10).ok().flatten(),
                "inputTokens": row.get::<Option<i64>>(11).ok().flatten(),
                "outputTokens": row.get::<Option<i64>>(12).ok().flatten(),
                "cacheReadInputTokens": row.get::<Option<i64>>(13).ok().flatten(),
                "cacheCreationInputTokens": row.get::<Option<i64>>(14).ok().flatten(),
                "totalTokens": row.get::<Option<i64>>(15).ok().flatten(),
                "costUsd": row.get::<Option<f64>>(16).ok().flatten(),
                "outputTokensPerSecond": row.get::<Option<f64>>(17).ok().flatten(),
            }));
        }
        Ok(out)
    }

    pub async fn get_request_payload(&self, id: &str) -> Result<Option<Value>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query("SELECT json FROM request_payloads WHERE id = ?", [id])
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to get payload: {e}")))?;
        let Some(row) = rows.next().await.ok().flatten() else {
            return Ok(None);
        };
        let json: String = row
            .get(0)
            .map_err(|e| ProxyError::Database(format!("Bad payload row: {e}")))?;
        Ok(serde_json::from_str(&json).ok())
    }
}

// ---------------------------------------------------------------------------
// Row mapping + write job application
// ---------------------------------------------------------------------------

const ACCOUNT_COLUMNS: &str = "id, name, provider, refresh_token, access_token, expires_at, \
     api_key, custom_endpoint, model_mappings, priority, paused, auto_fallback_enabled, \
     auto_refresh_enabled, rate_limited_until, rate_limit_remaining, rate_limit_reset, \
     rate_limit_status, session_start, session_request_count, request_count, total_requests, \
     last_used, created_at, tier";

fn row_to_account(row: &Row) -> Option<Account> {
    let id: String = row.get(0).ok()?;
    let provider: String = row.get::<String>(2).ok()?;
    Some(Account {
        id: Uuid::parse_str(&id).ok()?,
        name: row.get(1).ok()?,
        provider: ProviderKind::parse(&provider)?,
        refresh_token: row.get::<Option<String>>(3).ok().flatten(),
        access_token: row.get::<Option<String>>(4).ok().flatten(),
        access_token_expires_at: row.get::<Option<i64>>(5).ok().flatten().map(|v| v as u64),
        api_key: row.get::<Option<String>>(6).ok().flatten(),
        custom_endpoint: row.get::<Option<String>>(7).ok().flatten(),
        model_mappings: row
            .get::<Option<String>>(8)
            .ok()
            .flatten()
            .and_then(|s| serde_json::from_str(&s).ok()),
        priority: row.get::<i64>(9).unwrap_or(0),
        paused: row.get::<i64>(10).unwrap_or(0) != 0,
        auto_fallback_enabled: row.get::<i64>(11).unwrap_or(0) != 0,
        auto_refresh_enabled: row.get::<i64>(12).unwrap_or(0) != 0,
        rate_limited_until: row.get::<Option<i64>>(13).ok().flatten().map(|v| v as u64),
        rate_limit_remaining: row.get::<Option<i64>>(14).ok().flatten(),
        rate_limit_reset: row.get::<Option<i64>>(15).ok().flatten().map(|v| v as u64),
        rate_limit_status: row.get::<Option<String>>(16).ok().flatten(),
        session_start: row.get::<Option<i64>>(17).ok().flatten().map(|v| v as u64),
        session_request_count: row.get::<i64>(18).unwrap_or(0),
        request_count: row.get::<i64>(19).unwrap_or(0),
        total_requests: row.get::<i64>(20).unwrap_or(0),
        last_used: row.get::<Option<i64>>(21).ok().flatten().map(|v| v as u64),
        created_at: row.get::<i64>(22).unwrap_or(0) as u64,
        tier: row.get::<i64>(23).unwrap_or(1),
    })
}

/// Apply one queued write. Idempotent: re-running a job after a partial
/// failure converges to the same state.
pub(crate) async fn apply_job(job: &WriteJob) -> Result<(), ProxyError> {
    match job {
        WriteJob::Record { record, payload } => {
            let conn = db::get_conn().await?;
            conn.execute(
                r#"INSERT OR REPLACE INTO requests (id, timestamp, method, path, success,
                        failover_attempts)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
                (
                    record.id.to_string(),
                    record.timestamp as i64,
                    record.method.as_str(),
                    record.path.as_str(),
                    record.success as i64,
                    record.failover_attempts as i64,
                ),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to insert request: {e}")))?;

            if let Some(account) = record.account_used {
                conn.execute(
                    "UPDATE requests SET account_used = ? WHERE id = ?",
                    (account.to_string(), record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set account_used: {e}")))?;
            }
            if let Some(status) = record.status_code {
                conn.execute(
                    "UPDATE requests SET status_code = ? WHERE id = ?",
                    (status as i64, record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set status: {e}")))?;
            }
            if let Some(msg) = &record.error_message {
                conn.execute(
                    "UPDATE requests SET error_message = ? WHERE id = ?",
                    (msg.as_str(), record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set error: {e}")))?;
            }
            if let Some(ms) = record.response_time_ms {
                conn.execute(
                    "UPDATE requests SET response_time_ms = ? WHERE id = ?",
                    (ms as i64, record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set response time: {e}")))?;
            }
            if let Some(model) = &record.model {
                conn.execute(
                    "UPDATE requests SET model = ? WHERE id = ?",
                    (model.as_str(), record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set model: {e}")))?;
            }
            let token_cols: [(&str, Option<u64>); 5] = [
                ("input_tokens", record.input_tokens),
                ("output_tokens", record.output_tokens),
                ("cache_read_input_tokens", record.cache_read_input_tokens),
                (
                    "cache_creation_input_tokens",
                    record.cache_creation_input_tokens,
                ),
                ("total_tokens", record.total_tokens),
            ];
            for (col, value) in token_cols {
                if let Some(v) = value {
                    conn.execute(
                        &format!("UPDATE requests SET {col} = ? WHERE id = ?"),
                        (v as i64, record.id.to_string()),
                    )
                    .await
                    .map_err(|e| ProxyError::Database(format!("Failed to set {col}: {e}")))?;
                }
            }
            if let Some(cost) = record.cost_usd {
                conn.execute(
                    "UPDATE requests SET cost_usd = ? WHERE id = ?",
                    (cost, record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set cost: {e}")))?;
            }
            if let Some(tps) = record.output_tokens_per_second {
                conn.execute(
                    "UPDATE requests SET output_tokens_per_second = ? WHERE id = ?",
                    (tps, record.id.to_string()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to set tps: {e}")))?;
            }

            if let Some(payload) = payload {
                let json = serde_json::to_string(payload).unwrap_or_default();
                conn.execute(
                    "INSERT OR REPLACE INTO request_payloads (id, json) VALUES (?, ?)",
                    (record.id.to_string(), json.as_str()),
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to insert payload: {e}")))?;
            }
            Ok(())
        }
        WriteJob::AccountServed {
            account_id,
            now,
            tracks_session,
        } => {
            let conn = db::get_conn().await?;
            conn.execute(
                "UPDATE accounts SET last_used = ?, request_count = request_count + 1, total_requests = total_requests + 1 WHERE id = ?",
                (*now as i64, account_id.to_string()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to touch account: {e}")))?;
            if *tracks_session {
                conn.execute(
                    "UPDATE accounts SET session_request_count = session_request_count + 1 WHERE id = ?",
                    [account_id.to_string()],
                )
                .await
                .map_err(|e| ProxyError::Database(format!("Failed to bump session count: {e}")))?;
            }
            Ok(())
        }
        WriteJob::KeyUsed { key_id, now } => {
            let conn = db::get_conn().await?;
            conn.execute(
                "UPDATE api_keys SET usage_count = usage_count + 1, last_used = ? WHERE id = ?",
                (*now as i64, key_id.as_str()),
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to touch key: {e}")))?;
            Ok(())
        }
    }
}
