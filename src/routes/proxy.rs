//! Proxy entry for the `/v1/*` surface. Builds the dispatcher's inbound
//! view of the request and streams the chosen upstream's response back.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;
use crate::constants::SESSION_BYPASS_HEADER;
use crate::error::ProxyError;
use crate::providers::InboundRequest;
use crate::selector::RequestMeta;

/// Headers never archived in payload capture.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie"];

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    let json_body: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return ProxyError::Validation(format!("request body is not valid JSON: {e}"))
                    .to_response();
            }
        }
    };

    let stream = json_body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let inbound = InboundRequest {
        method: method.to_string(),
        path,
        body: json_body,
        stream,
    };

    let meta = RequestMeta {
        bypass_sticky: headers.contains_key(SESSION_BYPASS_HEADER),
    };

    let opts = state.dispatch_options().await;
    let payload_base = opts.capture_payloads.then(|| {
        let captured: serde_json::Map<String, Value> = headers
            .iter()
            .filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), Value::String(v.to_string())))
            })
            .collect();
        json!({
            "request": {
                "headers": captured,
                "body": inbound.body.clone(),
            }
        })
    });

    state.dispatcher.dispatch(inbound, meta, &opts, payload_base).await
}
