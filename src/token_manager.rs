//! OAuth access-token management. Guarantees at most one in-flight refresh
//! per account across concurrent dispatchers: the first caller spawns the
//! refresh, later arrivals await the same result. The refresh runs in its
//! own task so a cancelled caller cannot abort it for its peers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accounts::Account;
use crate::error::ProxyError;
use crate::providers::{RefreshedTokens, provider_for};
use crate::store::{Store, now_millis};

/// Refresh outcome shared with waiters; the error is a plain string so the
/// result stays cheaply cloneable across watch receivers.
type RefreshResult = Result<RefreshedTokens, String>;
type InFlightMap = Arc<Mutex<HashMap<Uuid, watch::Receiver<Option<RefreshResult>>>>>;

pub struct TokenManager {
    client: Client,
    store: Arc<Store>,
    in_flight: InFlightMap,
}

impl TokenManager {
    pub fn new(client: Client, store: Arc<Store>) -> Self {
        Self {
            client,
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve the credential to send upstream. Static keys return as-is;
    /// OAuth accounts return the stored access token while it is outside the
    /// refresh margin, otherwise a (deduplicated) refresh runs first.
    pub async fn get_valid_access_token(&self, account: &Account) -> Result<String, ProxyError> {
        if let Some(key) = &account.api_key {
            return Ok(key.clone());
        }

        if !account.needs_token_refresh(now_millis())
            && let Some(token) = &account.access_token
        {
            return Ok(token.clone());
        }

        self.refresh(account).await
    }

    /// Unconditional refresh, used after an upstream 401/403.
    pub async fn force_refresh(&self, account: &Account) -> Result<String, ProxyError> {
        self.refresh(account).await
    }

    async fn refresh(&self, account: &Account) -> Result<String, ProxyError> {
        let client = self.client.clone();
        let store = self.store.clone();
        let task_account = account.clone();

        let result = run_deduplicated(&self.in_flight, account.id, move || {
            Box::pin(async move {
                let provider = provider_for(task_account.provider);
                match provider.refresh_token(&client, &task_account).await {
                    Ok(tokens) => {
                        if let Err(e) = store
                            .update_tokens(task_account.id, &tokens.access_token, tokens.expires_at)
                            .await
                        {
                            warn!("Failed to persist refreshed tokens: {e}");
                        }
                        if let Some(rotated) = &tokens.refresh_token
                            && let Err(e) =
                                store.update_refresh_token(task_account.id, rotated).await
                        {
                            warn!("Failed to persist rotated refresh token: {e}");
                        }
                        debug!("Refreshed access token for account {}", task_account.name);
                        Ok(tokens)
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
        })
        .await;

        result
            .map(|tokens| tokens.access_token)
            .map_err(|reason| ProxyError::AuthRefreshFailed {
                account: account.name.clone(),
                reason,
            })
    }
}

/// Second arrival awaits the first's result. The in-flight entry is removed
/// once the refresh resolves, success or failure, so the next caller after a
/// failure is free to try again. The mutex is never held across the network
/// call: a placeholder receiver goes in, the lock drops, the spawned task
/// fulfills it.
async fn run_deduplicated<F>(map: &InFlightMap, id: Uuid, make: F) -> RefreshResult
where
    F: FnOnce() -> Pin<Box<dyn Future<Output = RefreshResult> + Send>>,
{
    let mut rx = {
        let mut guard = map.lock().expect("refresh in-flight lock");
        if let Some(rx) = guard.get(&id) {
            rx.clone()
        } else {
            let (tx, rx) = watch::channel(None);
            guard.insert(id, rx.clone());
            let map = Arc::clone(map);
            let fut = make();
            tokio::spawn(async move {
                let result = fut.await;
                map.lock().expect("refresh in-flight lock").remove(&id);
                let _ = tx.send(Some(result));
            });
            rx
        }
    };

    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err("refresh task aborted".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tokens(access: &str) -> RefreshedTokens {
        RefreshedTokens {
            access_token: access.to_string(),
            expires_at: u64::MAX,
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_deduplicate() {
        let map: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let map = Arc::clone(&map);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                run_deduplicated(&map, id, move || {
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(tokens("fresh"))
                    })
                })
                .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.access_token, "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(map.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_clears_in_flight_slot() {
        let map: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let id = Uuid::new_v4();

        let result = run_deduplicated(&map, id, || {
            Box::pin(async { Err("token endpoint said no".to_string()) })
        })
        .await;
        assert!(result.is_err());
        assert!(map.lock().unwrap().is_empty());

        // A later caller is free to retry and succeed
        let result = run_deduplicated(&map, id, || Box::pin(async { Ok(tokens("second")) })).await;
        assert_eq!(result.unwrap().access_token, "second");
    }

    #[tokio::test]
    async fn test_distinct_accounts_refresh_in_parallel() {
        let map: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let fut_a = run_deduplicated(&map, a, || Box::pin(async { Ok(tokens("a")) }));
        let fut_b = run_deduplicated(&map, b, || Box::pin(async { Ok(tokens("b")) }));
        let (ra, rb) = tokio::join!(fut_a, fut_b);
        assert_eq!(ra.unwrap().access_token, "a");
        assert_eq!(rb.unwrap().access_token, "b");
    }

    #[tokio::test]
    async fn test_waiter_survives_first_caller_cancellation() {
        let map: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let id = Uuid::new_v4();

        let first = {
            let map = Arc::clone(&map);
            tokio::spawn(async move {
                run_deduplicated(&map, id, || {
                    Box::pin(async {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(tokens("shared"))
                    })
                })
                .await
            })
        };
        // Give the first caller time to register the in-flight entry, then
        // cancel it. The spawned refresh keeps running for the second caller.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        first.abort();

        let second = run_deduplicated(&map, id, || {
            Box::pin(async { panic!("second caller must reuse the in-flight refresh") })
        })
        .await;
        assert_eq!(second.unwrap().access_token, "shared");
    }
}
