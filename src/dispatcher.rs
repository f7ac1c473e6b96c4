//! Per-request dispatch: selection, credential resolution, upstream send
//! with retries and jittered backoff, failover across candidates, and
//! hand-off to the stream pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use rand::Rng;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::accounts::Account;
use crate::error::ProxyError;
use crate::pricing::PricingCatalog;
use crate::providers::{InboundRequest, OutboundRequest, provider_for};
use crate::selector::{RequestMeta, select};
use crate::store::{RequestRecord, Store, now_millis};
use crate::streaming::{PipeContext, pipe_response};
use crate::token_manager::TokenManager;

/// Back-off applied when a 429 arrives with neither retry-after nor a reset
/// timestamp.
const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 60_000;

/// Snapshot of the runtime-mutable knobs, taken once per request.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub session_duration_ms: u64,
    pub capture_payloads: bool,
}

pub struct Dispatcher {
    pub store: Arc<Store>,
    pub tokens: Arc<TokenManager>,
    pub pricing: Arc<PricingCatalog>,
    pub client: Client,
}

enum AttemptOutcome {
    /// Final upstream response; pipe it to the client.
    Respond(reqwest::Response, OutboundRequest),
    /// Account-level failure; move to the next candidate.
    Failover { rate_limited: bool, error: String },
}

impl Dispatcher {
    pub async fn dispatch(
        &self,
        inbound: InboundRequest,
        meta: RequestMeta,
        opts: &DispatchOptions,
        payload_base: Option<Value>,
    ) -> Response {
        let mut record = RequestRecord::new(&inbound.method, &inbound.path);

        let accounts = match self.store.list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Account listing failed: {e}");
                return e.to_response();
            }
        };

        let now = now_millis();
        let selection = select(&accounts, &meta, now, opts.session_duration_ms);

        if selection.candidates.is_empty() {
            record.error_message = Some("no available accounts".to_string());
            record.status_code = Some(503);
            self.store.record_request(record, None);
            return ProxyError::NoAccountsAvailable.to_response();
        }

        if let Some(id) = selection.reset_session
            && let Err(e) = self.store.reset_session(id, now).await
        {
            warn!("Session reset failed for {id}: {e}");
        }

        let mut last_error = String::from("no upstream attempt made");
        let mut all_rate_limited = true;
        let mut soonest_retry_ms: Option<u64> = None;

        for account in &selection.candidates {
            match self.try_account(account, &inbound, opts).await {
                Ok(AttemptOutcome::Respond(resp, outbound)) => {
                    record.account_used = Some(account.id);
                    record.model = Some(outbound.model.clone());

                    let payload = opts.capture_payloads.then(|| {
                        build_payload(
                            payload_base.clone(),
                            &inbound,
                            account,
                            record.failover_attempts,
                            selection.candidates.len(),
                        )
                    });

                    let ctx = PipeContext {
                        store: Arc::clone(&self.store),
                        pricing: Arc::clone(&self.pricing),
                        provider: provider_for(account.provider),
                        record,
                        upstream_model: outbound.model,
                        client_model: inbound.model().unwrap_or_default().to_string(),
                        account: Some((account.id, account.provider.tracks_session())),
                        payload,
                    };
                    return pipe_response(resp, ctx).await;
                }
                Ok(AttemptOutcome::Failover {
                    rate_limited,
                    error,
                }) => {
                    record.failover_attempts += 1;
                    all_rate_limited &= rate_limited;
                    if rate_limited
                        && let Ok(Some(fresh)) = self.store.get_account(account.id).await
                        && let Some(until) = fresh.rate_limited_until
                    {
                        let wait = until.saturating_sub(now_millis());
                        soonest_retry_ms =
                            Some(soonest_retry_ms.map_or(wait, |prev| prev.min(wait)));
                    }
                    debug!("Failing over from account {}: {error}", account.name);
                    last_error = error;
                }
                Err(validation) => {
                    // Malformed inbound request: no other account can help.
                    record.status_code = Some(400);
                    record.error_message = Some(validation.to_string());
                    self.store.record_request(record, None);
                    return validation.to_response();
                }
            }
        }

        let error = if all_rate_limited {
            ProxyError::AllRateLimited {
                retry_after_secs: soonest_retry_ms
                    .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF_MS)
                    .div_ceil(1000),
            }
        } else {
            ProxyError::UpstreamExhausted(last_error)
        };
        record.status_code = Some(match &error {
            ProxyError::AllRateLimited { .. } => 429,
            _ => 502,
        });
        record.error_message = Some(error.to_string());
        self.store.record_request(record, None);
        error.to_response()
    }

    /// One candidate: credential, request shaping, then the bounded retry
    /// loop. `Err` is reserved for inbound validation failures that must not
    /// fail over.
    async fn try_account(
        &self,
        account: &Account,
        inbound: &InboundRequest,
        opts: &DispatchOptions,
    ) -> Result<AttemptOutcome, ProxyError> {
        let mut credential = match self.tokens.get_valid_access_token(account).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(AttemptOutcome::Failover {
                    rate_limited: false,
                    error: e.to_string(),
                });
            }
        };

        let provider = provider_for(account.provider);
        let mut outbound = match provider.prepare_request(inbound, account, &credential) {
            Ok(o) => o,
            Err(e @ ProxyError::Validation(_)) => return Err(e),
            Err(e) => {
                return Ok(AttemptOutcome::Failover {
                    rate_limited: false,
                    error: e.to_string(),
                });
            }
        };

        let mut forced_refresh_done = false;
        let mut retry: u32 = 0;

        loop {
            let resp = match self.send(inbound, &outbound).await {
                Ok(resp) => resp,
                Err(e) => {
                    // Network error: transient, retried with backoff
                    if retry < opts.retry_attempts {
                        tokio::time::sleep(backoff_delay(retry, opts)).await;
                        retry += 1;
                        continue;
                    }
                    return Ok(AttemptOutcome::Failover {
                        rate_limited: false,
                        error: format!("network error: {e}"),
                    });
                }
            };

            let status = resp.status().as_u16();
            let signal = provider.parse_rate_limit(resp.headers(), status);

            if signal.is_limited(status) {
                let now = now_millis();
                let until = signal
                    .limited_until(now)
                    .unwrap_or(now + DEFAULT_RATE_LIMIT_BACKOFF_MS);
                if let Err(e) = self
                    .store
                    .mark_rate_limited(
                        account.id,
                        Some(until),
                        signal.status.as_deref(),
                        signal.remaining,
                        signal.reset_at,
                    )
                    .await
                {
                    warn!("Failed to mark {} rate limited: {e}", account.name);
                }
                return Ok(AttemptOutcome::Failover {
                    rate_limited: true,
                    error: format!("account {} rate limited (until {until})", account.name),
                });
            }

            // Keep remaining/reset telemetry fresh even on healthy responses
            if signal.remaining.is_some() || signal.reset_at.is_some() {
                let _ = self
                    .store
                    .mark_rate_limited(
                        account.id,
                        None,
                        signal.status.as_deref(),
                        signal.remaining,
                        signal.reset_at,
                    )
                    .await;
            }

            if matches!(status, 502 | 503 | 504) {
                if retry < opts.retry_attempts {
                    tokio::time::sleep(backoff_delay(retry, opts)).await;
                    retry += 1;
                    continue;
                }
                return Ok(AttemptOutcome::Failover {
                    rate_limited: false,
                    error: format!("upstream returned {status} after retries"),
                });
            }

            if matches!(status, 401 | 403) && account.provider.uses_oauth() {
                if !forced_refresh_done {
                    forced_refresh_done = true;
                    match self.tokens.force_refresh(account).await {
                        Ok(fresh) => {
                            credential = fresh;
                            outbound = match provider.prepare_request(inbound, account, &credential)
                            {
                                Ok(o) => o,
                                Err(e) => {
                                    return Ok(AttemptOutcome::Failover {
                                        rate_limited: false,
                                        error: e.to_string(),
                                    });
                                }
                            };
                            continue;
                        }
                        Err(e) => {
                            return Ok(AttemptOutcome::Failover {
                                rate_limited: false,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                return Ok(AttemptOutcome::Failover {
                    rate_limited: false,
                    error: format!("upstream auth rejected ({status}) after token refresh"),
                });
            }

            // 2xx and remaining 4xx are final for this request
            return Ok(AttemptOutcome::Respond(resp, outbound));
        }
    }

    async fn send(
        &self,
        inbound: &InboundRequest,
        outbound: &OutboundRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        // Idle timeouts come from the shared client's read_timeout; a total
        // timeout here would cut long-lived SSE streams short.
        let method = Method::from_bytes(inbound.method.as_bytes()).unwrap_or(Method::POST);
        let mut req = self.client.request(method.clone(), &outbound.url);
        for (name, value) in &outbound.headers {
            req = req.header(*name, value);
        }
        if method != Method::GET {
            req = req.json(&outbound.body);
        }
        req.send().await
    }
}

/// Exponential backoff with ±25% jitter against synchronized retries.
fn backoff_delay(retry: u32, opts: &DispatchOptions) -> Duration {
    let exp = opts.retry_delay_ms as f64 * opts.retry_backoff.powi(retry as i32);
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((exp * jitter) as u64)
}

/// Archive blob for opt-in payload capture.
fn build_payload(
    base: Option<Value>,
    inbound: &InboundRequest,
    account: &Account,
    failover_attempts: u32,
    accounts_attempted: usize,
) -> Value {
    let mut payload = base.unwrap_or_else(|| json!({}));
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("request")
            .or_insert_with(|| json!({"headers": {}, "body": inbound.body.clone()}));
        obj.insert("response".to_string(), json!({}));
        obj.insert(
            "meta".to_string(),
            json!({
                "accountId": account.id,
                "retry": failover_attempts,
                "timestamp": now_millis(),
                "accountsAttempted": accounts_attempted,
            }),
        );
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> DispatchOptions {
        DispatchOptions {
            retry_attempts: 3,
            retry_delay_ms: 1000,
            retry_backoff: 2.0,
            session_duration_ms: 5 * 60 * 60 * 1000,
            capture_payloads: false,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially_within_jitter() {
        let opts = opts();
        for retry in 0..4 {
            let expected = 1000.0 * 2.0_f64.powi(retry as i32);
            let delay = backoff_delay(retry, &opts).as_millis() as f64;
            assert!(delay >= expected * 0.75 - 1.0, "retry {retry}: {delay}");
            assert!(delay <= expected * 1.25 + 1.0, "retry {retry}: {delay}");
        }
    }
}
