//! Background loops: the per-account usage poller, the session auto-refresh
//! synthesizer, and the retention sweep. All three register with the
//! interval manager and read fresh account state from the store each tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::constants::{
    ANTHROPIC_USAGE_URL, ANTHROPIC_VERSION, OAUTH_BETA_HEADER, RETENTION_INTERVAL_MS,
    USAGE_POLL_INTERVAL_MS,
};
use crate::providers::InboundRequest;
use crate::scheduler::JobFn;
use crate::selector::RequestMeta;
use crate::store::{now_millis, retention::retention_sweep};

/// Usage poller failure backoff: 5 min doubling to a 1 h cap, 10 attempts.
const POLL_BACKOFF_BASE_MS: u64 = 5 * 60 * 1000;
const POLL_BACKOFF_CAP_MS: u64 = 60 * 60 * 1000;
const POLL_MAX_ATTEMPTS: u32 = 10;

/// Cached usage-window utilization per account, refreshed by the poller.
#[derive(Debug, Clone, Default, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindowSnapshot {
    pub five_hour_utilization: Option<f64>,
    pub five_hour_reset_at: Option<u64>,
    pub seven_day_utilization: Option<f64>,
    pub seven_day_reset_at: Option<u64>,
    pub fetched_at: u64,
}

#[derive(Debug, Deserialize)]
struct UsageLimit {
    utilization: Option<f64>,
    resets_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageLimit>,
    seven_day: Option<UsageLimit>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PollBackoff {
    failures: u32,
    next_attempt: u64,
}

fn parse_reset(s: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis() as u64)
}

/// Register all three loops. Handles are owned by the interval manager;
/// `AppState::shutdown` stops them.
pub fn register_jobs(state: Arc<AppState>) {
    let backoffs: Arc<Mutex<HashMap<Uuid, PollBackoff>>> = Arc::new(Mutex::new(HashMap::new()));
    let poll_state = Arc::clone(&state);
    let poller: JobFn = Arc::new(move || {
        let state = Arc::clone(&poll_state);
        let backoffs = Arc::clone(&backoffs);
        Box::pin(async move {
            poll_usage(&state, &backoffs).await;
        })
    });
    state
        .intervals
        .register("usage-poller", poller, USAGE_POLL_INTERVAL_MS, true, 1);

    let fired: Arc<Mutex<HashMap<Uuid, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let refresh_state = Arc::clone(&state);
    let refresher: JobFn = Arc::new(move || {
        let state = Arc::clone(&refresh_state);
        let fired = Arc::clone(&fired);
        Box::pin(async move {
            auto_refresh_tick(&state, &fired).await;
        })
    });
    state
        .intervals
        .register("session-auto-refresh", refresher, USAGE_POLL_INTERVAL_MS, false, 1);

    let sweep_state = Arc::clone(&state);
    let sweeper: JobFn = Arc::new(move || {
        let state = Arc::clone(&sweep_state);
        Box::pin(async move {
            let (payload_ms, request_ms) = {
                let runtime = state.runtime.read().await;
                (
                    runtime.data_retention_days as u64 * 24 * 60 * 60 * 1000,
                    runtime.request_retention_days as u64 * 24 * 60 * 60 * 1000,
                )
            };
            match retention_sweep(&state.store, payload_ms, request_ms).await {
                Ok(outcome) => debug!(
                    payloads = outcome.payloads_deleted,
                    requests = outcome.requests_deleted,
                    rate_limits = outcome.rate_limits_cleared,
                    oauth_sessions = outcome.oauth_sessions_deleted,
                    "Retention sweep complete"
                ),
                Err(e) => warn!("Retention sweep failed: {e}"),
            }
        })
    });
    state
        .intervals
        .register("retention", sweeper, RETENTION_INTERVAL_MS, true, 1);
}

/// Query the provider usage endpoint for every OAuth account and refresh
/// the cached window state plus the store's `rate_limit_reset`. Paused
/// accounts are still polled (the token refresh is allowed either way);
/// paused-ness itself is sampled fresh from the store each tick.
async fn poll_usage(state: &AppState, backoffs: &Mutex<HashMap<Uuid, PollBackoff>>) {
    let accounts = match state.store.list_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!("Usage poller could not list accounts: {e}");
            return;
        }
    };

    for account in accounts
        .iter()
        .filter(|a| a.provider.uses_oauth())
    {
        let now = now_millis();
        {
            let guard = backoffs.lock().expect("poll backoff lock");
            if let Some(b) = guard.get(&account.id) {
                if b.failures >= POLL_MAX_ATTEMPTS {
                    continue;
                }
                if now < b.next_attempt {
                    continue;
                }
            }
        }

        match fetch_account_usage(state, account).await {
            Ok(snapshot) => {
                if let Some(reset) = snapshot.five_hour_reset_at
                    && let Err(e) = state
                        .store
                        .mark_rate_limited(account.id, None, None, None, Some(reset))
                        .await
                {
                    warn!("Failed to store window reset for {}: {e}", account.name);
                }
                state
                    .usage_windows
                    .write()
                    .await
                    .insert(account.id, snapshot);
                backoffs
                    .lock()
                    .expect("poll backoff lock")
                    .remove(&account.id);
            }
            Err(e) => {
                let mut guard = backoffs.lock().expect("poll backoff lock");
                let entry = guard.entry(account.id).or_default();
                entry.failures += 1;
                let delay = (POLL_BACKOFF_BASE_MS << (entry.failures.saturating_sub(1)).min(8))
                    .min(POLL_BACKOFF_CAP_MS);
                entry.next_attempt = now + delay;
                if entry.failures >= POLL_MAX_ATTEMPTS {
                    warn!(
                        "Usage polling for {} gave up after {} attempts: {e}",
                        account.name, entry.failures
                    );
                } else {
                    debug!(
                        "Usage poll failed for {} (attempt {}), next in {}ms: {e}",
                        account.name, entry.failures, delay
                    );
                }
            }
        }
    }
}

async fn fetch_account_usage(
    state: &AppState,
    account: &crate::accounts::Account,
) -> Result<UsageWindowSnapshot, String> {
    let token = state
        .tokens
        .get_valid_access_token(account)
        .await
        .map_err(|e| e.to_string())?;

    let response = state
        .http_client
        .get(ANTHROPIC_USAGE_URL)
        .header("authorization", format!("Bearer {token}"))
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", OAUTH_BETA_HEADER)
        .header("accept", "application/json")
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("usage request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("usage endpoint returned {}", response.status()));
    }

    let usage: UsageResponse = response
        .json()
        .await
        .map_err(|e| format!("bad usage response: {e}"))?;

    Ok(UsageWindowSnapshot {
        five_hour_utilization: usage.five_hour.as_ref().and_then(|u| u.utilization),
        five_hour_reset_at: usage
            .five_hour
            .as_ref()
            .and_then(|u| u.resets_at.as_deref())
            .and_then(parse_reset),
        seven_day_utilization: usage.seven_day.as_ref().and_then(|u| u.utilization),
        seven_day_reset_at: usage
            .seven_day
            .as_ref()
            .and_then(|u| u.resets_at.as_deref())
            .and_then(parse_reset),
        fetched_at: now_millis(),
    })
}

/// When an auto-refresh account's usage window has lapsed with no organic
/// traffic, push one minimal message through the dispatcher with the
/// sticky-session bypass header so the upstream window restarts cleanly.
/// Fires at most once per announced window reset.
async fn auto_refresh_tick(state: &AppState, fired: &Mutex<HashMap<Uuid, u64>>) {
    let accounts = match state.store.list_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!("Auto-refresh could not list accounts: {e}");
            return;
        }
    };

    let session_duration = state.runtime.read().await.session_duration_ms;
    let now = now_millis();

    for account in accounts {
        if !account.auto_refresh_enabled
            || !account.provider.tracks_session()
            || !account.is_available(now)
        {
            continue;
        }
        let Some(reset) = account.rate_limit_reset else {
            continue;
        };
        if reset > now || !account.session_expired(now, session_duration) {
            continue;
        }
        {
            let guard = fired.lock().expect("auto refresh lock");
            if guard.get(&account.id).is_some_and(|&at| at >= reset) {
                continue;
            }
        }

        debug!("Auto-refreshing session window for {}", account.name);
        let inbound = InboundRequest {
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            body: json!({
                "model": "claude-haiku-4-5",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}]
            }),
            stream: false,
        };
        let meta = RequestMeta {
            bypass_sticky: true,
        };
        let opts = state.dispatch_options().await;
        let _ = state
            .dispatcher
            .dispatch(inbound, meta, &opts, None)
            .await;

        fired
            .lock()
            .expect("auto refresh lock")
            .insert(account.id, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reset_rfc3339() {
        let ms = parse_reset("2026-08-01T12:00:00Z").unwrap();
        assert!(ms > 1_700_000_000_000);
        assert_eq!(ms % 1000, 0);
        assert!(parse_reset("not a date").is_none());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let delays: Vec<u64> = (1..=10)
            .map(|failures: u32| {
                (POLL_BACKOFF_BASE_MS << (failures.saturating_sub(1)).min(8))
                    .min(POLL_BACKOFF_CAP_MS)
            })
            .collect();
        assert_eq!(delays[0], POLL_BACKOFF_BASE_MS);
        assert_eq!(delays[1], POLL_BACKOFF_BASE_MS * 2);
        assert!(delays.iter().all(|&d| d <= POLL_BACKOFF_CAP_MS));
        assert_eq!(*delays.last().unwrap(), POLL_BACKOFF_CAP_MS);
    }
}
