//! Retention sweep: ages out request payloads and records, clears stale
//! rate-limit windows, prunes expired OAuth sessions, then reclaims freed
//! pages in a bounded incremental vacuum step.

use tracing::info;

use crate::constants::INCREMENTAL_VACUUM_PAGES;
use crate::db;
use crate::error::ProxyError;
use crate::store::{Store, now_millis};

pub struct SweepOutcome {
    pub payloads_deleted: u64,
    pub requests_deleted: u64,
    pub rate_limits_cleared: u64,
    pub oauth_sessions_deleted: u64,
}

pub async fn retention_sweep(
    store: &Store,
    payload_age_ms: u64,
    request_age_ms: u64,
) -> Result<SweepOutcome, ProxyError> {
    let now = now_millis();
    let conn = db::get_conn().await?;

    let payload_cutoff = now.saturating_sub(payload_age_ms) as i64;
    let payloads_deleted = conn
        .execute(
            "DELETE FROM request_payloads WHERE id IN (SELECT id FROM requests WHERE timestamp < ?)",
            (payload_cutoff,),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to delete payloads: {e}")))?;

    let request_cutoff = now.saturating_sub(request_age_ms) as i64;
    let requests_deleted = conn
        .execute("DELETE FROM requests WHERE timestamp < ?", (request_cutoff,))
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to delete requests: {e}")))?;

    let rate_limits_cleared = store.clear_expired_rate_limits(now).await?;

    let oauth_sessions_deleted = conn
        .execute(
            "DELETE FROM oauth_sessions WHERE expires_at < ?",
            (now as i64,),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to prune oauth sessions: {e}")))?;

    // Bounded page reclamation; a full VACUUM would stall concurrent readers.
    conn.execute(
        &format!("PRAGMA incremental_vacuum({INCREMENTAL_VACUUM_PAGES})"),
        (),
    )
    .await
    .map_err(|e| ProxyError::Database(format!("Incremental vacuum failed: {e}")))?;

    if payloads_deleted > 0 || requests_deleted > 0 || oauth_sessions_deleted > 0 {
        info!(
            "Retention sweep: {payloads_deleted} payloads, {requests_deleted} requests, {oauth_sessions_deleted} oauth sessions removed"
        );
    }

    Ok(SweepOutcome {
        payloads_deleted,
        requests_deleted,
        rate_limits_cleared,
        oauth_sessions_deleted,
    })
}
