//! Anthropic OAuth account onboarding: PKCE session bookkeeping and the
//! authorization-code exchange. Sessions persist in the database and are
//! swept by retention once expired; the browser half of the flow lives
//! outside this process.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::accounts::{Account, ProviderKind};
use crate::constants::{
    ANTHROPIC_AUTHORIZE_URL, ANTHROPIC_CLIENT_ID, ANTHROPIC_REDIRECT_URI, ANTHROPIC_SCOPES,
    ANTHROPIC_TOKEN_URL,
};
use crate::db;
use crate::error::ProxyError;
use crate::store::{Store, now_millis};

/// PKCE sessions live this long before the sweep reclaims them.
const SESSION_TTL_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

#[derive(Debug)]
pub struct FlowSession {
    pub account_name: String,
    pub verifier: String,
    pub mode: String,
}

pub struct OAuthFlow {
    client: Client,
}

impl OAuthFlow {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn generate_verifier() -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn challenge(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Start a flow: persist the PKCE session, return (session id,
    /// authorize URL for the operator's browser).
    pub async fn begin(&self, account_name: &str, mode: &str) -> Result<(Uuid, String), ProxyError> {
        let id = Uuid::new_v4();
        let verifier = Self::generate_verifier();
        let challenge = Self::challenge(&verifier);
        let expires_at = now_millis() + SESSION_TTL_MS;

        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT INTO oauth_sessions (id, account_name, verifier, mode, expires_at) VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                account_name,
                verifier.as_str(),
                mode,
                expires_at as i64,
            ),
        )
        .await
        .map_err(|e| ProxyError::Database(format!("Failed to save oauth session: {e}")))?;

        let url = format!(
            "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            ANTHROPIC_AUTHORIZE_URL,
            ANTHROPIC_CLIENT_ID,
            urlencoding::encode(ANTHROPIC_REDIRECT_URI),
            urlencoding::encode(ANTHROPIC_SCOPES),
            challenge,
            verifier
        );
        Ok((id, url))
    }

    async fn load_session(&self, id: Uuid) -> Result<FlowSession, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT account_name, verifier, mode, expires_at FROM oauth_sessions WHERE id = ?",
                [id.to_string()],
            )
            .await
            .map_err(|e| ProxyError::Database(format!("Failed to load oauth session: {e}")))?;

        let row = rows
            .next()
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ProxyError::OAuth("unknown or expired oauth session".into()))?;

        let expires_at = row.get::<i64>(3).unwrap_or(0) as u64;
        if now_millis() >= expires_at {
            return Err(ProxyError::OAuth("oauth session expired".into()));
        }

        Ok(FlowSession {
            account_name: row.get(0).unwrap_or_default(),
            verifier: row.get(1).unwrap_or_default(),
            mode: row.get(2).unwrap_or_default(),
        })
    }

    /// Exchange the pasted authorization code ("code#state") and create the
    /// account. The session is discarded on success.
    pub async fn complete(
        &self,
        store: &Store,
        session_id: Uuid,
        code: &str,
        priority: i64,
    ) -> Result<Account, ProxyError> {
        let session = self.load_session(session_id).await?;

        let parts: Vec<&str> = code.splitn(2, '#').collect();
        let actual_code = parts[0];
        let state = parts.get(1).copied().unwrap_or("");

        let body = serde_json::json!({
            "code": actual_code,
            "state": state,
            "grant_type": "authorization_code",
            "client_id": ANTHROPIC_CLIENT_ID,
            "redirect_uri": ANTHROPIC_REDIRECT_URI,
            "code_verifier": session.verifier,
        });

        let response = self
            .client
            .post(ANTHROPIC_TOKEN_URL)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::OAuth(format!("code exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::OAuth(format!(
                "code exchange failed ({status}): {text}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::OAuth(format!("bad token response: {e}")))?;

        let now = now_millis();
        let account = Account {
            id: Uuid::new_v4(),
            name: session.account_name.clone(),
            provider: ProviderKind::AnthropicOauth,
            refresh_token: Some(token.refresh_token),
            access_token: Some(token.access_token),
            access_token_expires_at: Some(now + token.expires_in * 1000),
            api_key: None,
            custom_endpoint: None,
            model_mappings: None,
            priority,
            tier: 1,
            paused: false,
            auto_fallback_enabled: false,
            auto_refresh_enabled: session.mode == "max",
            rate_limited_until: None,
            rate_limit_remaining: None,
            rate_limit_reset: None,
            rate_limit_status: None,
            session_start: None,
            session_request_count: 0,
            request_count: 0,
            total_requests: 0,
            last_used: None,
            created_at: now,
        };
        store.insert_account(&account).await?;

        let conn = db::get_conn().await?;
        let _ = conn
            .execute(
                "DELETE FROM oauth_sessions WHERE id = ?",
                [session_id.to_string()],
            )
            .await;

        Ok(account)
    }
}
