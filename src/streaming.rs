//! Stream pipeline: pipes the upstream body to the client verbatim while a
//! second consumer extracts usage from a bounded capture buffer. Telemetry
//! is recorded when the pipe ends; a drop guard covers early ends from
//! client disconnects.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::interval;
use uuid::Uuid;

use crate::constants::{BODY_CAPTURE_CAP, STREAM_CAPTURE_CAP};
use crate::pricing::PricingCatalog;
use crate::providers::{Provider, StreamTranslator, TokenUsage};
use crate::store::{RequestRecord, Store, now_millis};

/// Keep-alive interval for SSE streams (prevents proxy/load balancer timeouts).
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSE keep-alive comment (ignored by clients but keeps connection alive).
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

pub struct PipeContext {
    pub store: Arc<Store>,
    pub pricing: Arc<PricingCatalog>,
    pub provider: &'static dyn Provider,
    pub record: RequestRecord,
    /// Model id sent upstream; prices the request.
    pub upstream_model: String,
    /// Model id the client asked for; translated responses echo it.
    pub client_model: String,
    pub account: Option<(Uuid, bool)>,
    pub payload: Option<Value>,
}

/// Finalizes the request record exactly once. Dropping the pipe mid-stream
/// (client disconnect) records what was observed with success=false.
struct RecordFinalizer {
    store: Arc<Store>,
    pricing: Arc<PricingCatalog>,
    record: Option<RequestRecord>,
    usage: TokenUsage,
    upstream_model: String,
    account: Option<(Uuid, bool)>,
    payload: Option<Value>,
    upstream_complete: bool,
}

impl RecordFinalizer {
    fn finish(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        let now = now_millis();
        let elapsed = now.saturating_sub(record.timestamp);
        record.response_time_ms = Some(elapsed);
        record.success = self.upstream_complete && record.status_code.is_none_or(|s| s < 400);
        if !self.upstream_complete && record.error_message.is_none() {
            record.error_message = Some("stream ended before completion".to_string());
        }

        if !self.usage.is_empty() {
            record.input_tokens = Some(self.usage.input_tokens);
            record.output_tokens = Some(self.usage.output_tokens);
            record.cache_read_input_tokens = Some(self.usage.cache_read_input_tokens);
            record.cache_creation_input_tokens = Some(self.usage.cache_creation_input_tokens);
            record.total_tokens = Some(self.usage.total());
            record.cost_usd = self.pricing.cost_usd(&self.upstream_model, &self.usage);
            if elapsed > 0 && self.usage.output_tokens > 0 {
                record.output_tokens_per_second =
                    Some(self.usage.output_tokens as f64 / (elapsed as f64 / 1000.0));
            }
        }

        if let Some((account_id, tracks_session)) = self.account {
            self.store.touch_account_served(account_id, tracks_session);
        }
        self.store.record_request(record, self.payload.take());
    }

    fn set_status(&mut self, status: u16) {
        if let Some(record) = self.record.as_mut() {
            record.status_code = Some(status);
        }
    }

    fn set_error(&mut self, message: String) {
        if let Some(record) = self.record.as_mut() {
            record.error_message = Some(message);
        }
    }
}

impl Drop for RecordFinalizer {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Pipe an upstream response to the client. The dispatcher hands every
/// final upstream response here, success or error.
pub async fn pipe_response(resp: reqwest::Response, ctx: PipeContext) -> Response {
    let status = resp.status().as_u16();
    let is_sse = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let provider = ctx.provider;
    let client_model = ctx.client_model.clone();
    let mut finalizer = RecordFinalizer {
        store: ctx.store,
        pricing: ctx.pricing,
        record: Some(ctx.record),
        usage: TokenUsage::default(),
        upstream_model: ctx.upstream_model,
        account: ctx.account,
        payload: ctx.payload,
        upstream_complete: false,
    };
    finalizer.set_status(status);

    if is_sse && status < 400 {
        pipe_sse(resp, provider, client_model, finalizer)
    } else {
        pipe_buffered(resp, provider, &client_model, finalizer).await
    }
}

/// SSE tee. Each upstream chunk is forwarded in arrival order; a bounded
/// copy feeds the usage scanner and, for translated providers, the frame
/// translator. Parsing happens between chunk yields, so ordering is
/// preserved by construction.
fn pipe_sse(
    resp: reqwest::Response,
    provider: &'static dyn Provider,
    client_model: String,
    mut finalizer: RecordFinalizer,
) -> Response {
    let mut translator = provider.stream_translator(&client_model);

    let out = stream! {
        let mut body = std::pin::pin!(resp.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        let mut scanned: usize = 0;
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                biased; // Prefer data over keep-alive when both ready

                chunk_opt = body.next() => {
                    let Some(chunk_result) = chunk_opt else {
                        finalizer.upstream_complete = true;
                        break;
                    };

                    let chunk = match chunk_result {
                        Ok(c) => c,
                        Err(e) => {
                            finalizer.set_error(format!("upstream read failed: {e}"));
                            yield Err(std::io::Error::other(e));
                            return;
                        }
                    };

                    if translator.is_none() {
                        // Pass-through tee: the client sees the exact bytes.
                        yield Ok(chunk.clone());
                    }

                    // Reassemble SSE lines from raw bytes: a network chunk
                    // can split a line, or a multibyte character, anywhere.
                    buffer.extend_from_slice(&chunk);
                    let buffer_cap = if translator.is_some() {
                        BODY_CAPTURE_CAP
                    } else {
                        STREAM_CAPTURE_CAP
                    };
                    if buffer.len() > buffer_cap {
                        buffer.clear();
                        finalizer.usage.partial = true;
                    }

                    let mut translated = String::new();
                    while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                        let Ok(line) = std::str::from_utf8(&raw) else {
                            continue;
                        };
                        let Some(data) = line.trim_end_matches(['\r', '\n']).strip_prefix("data: ")
                        else {
                            continue;
                        };
                        if data == "[DONE]" {
                            continue;
                        }

                        let Ok(frame) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };

                        // The scan cap bounds usage extraction only; past it
                        // token fields stay partial. Translation must see
                        // every frame regardless: in translator mode these
                        // events ARE the client's response.
                        scanned += data.len();
                        if scanned <= STREAM_CAPTURE_CAP {
                            finalizer.usage.merge(&provider.parse_usage(&frame));
                        } else {
                            finalizer.usage.partial = true;
                        }

                        if let Some(tr) = translator.as_mut() {
                            for event in tr.translate(&frame) {
                                translated.push_str(&event);
                            }
                        }
                    }

                    if !translated.is_empty() {
                        yield Ok(Bytes::from(translated));
                    }
                }

                // Keep-alive timer fired
                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }

        // Pass-through mode already forwarded every byte; only a translator
        // has closing events to emit.
        if let Some(tr) = translator.as_mut() {
            let mut tail = String::new();
            for event in tr.finish() {
                tail.push_str(&event);
            }
            if !tail.is_empty() {
                yield Ok(Bytes::from(tail));
            }
        }

        finalizer.finish();
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(out))
        .unwrap_or_else(|_| crate::error::ProxyError::Internal.to_response())
}

/// Non-streaming bodies buffer whole (capped), extract usage, translate if
/// the provider needs it, and forward with the upstream status.
async fn pipe_buffered(
    resp: reqwest::Response,
    provider: &'static dyn Provider,
    client_model: &str,
    mut finalizer: RecordFinalizer,
) -> Response {
    let status = resp.status();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            finalizer.set_error(format!("upstream body read failed: {e}"));
            return crate::error::ProxyError::Network(e).to_response();
        }
    };
    finalizer.upstream_complete = true;

    if status.as_u16() >= 400 {
        let snippet: String = String::from_utf8_lossy(&bytes).chars().take(500).collect();
        finalizer.set_error(format!("upstream returned {status}: {snippet}"));
        finalizer.finish();
        return build_json_response(status.as_u16(), bytes);
    }

    if bytes.len() > BODY_CAPTURE_CAP {
        // Too large to inspect: forward as-is, token fields stay partial
        finalizer.usage.partial = true;
        finalizer.finish();
        return build_json_response(status.as_u16(), bytes);
    }

    let Ok(json) = serde_json::from_slice::<Value>(&bytes) else {
        finalizer.usage.partial = true;
        finalizer.finish();
        return build_json_response(status.as_u16(), bytes);
    };

    finalizer.usage.merge(&provider.parse_usage(&json));

    let out = match provider.translate_response(&json, client_model) {
        Some(translated) => Bytes::from(translated.to_string()),
        None => bytes,
    };
    finalizer.finish();
    build_json_response(status.as_u16(), out)
}

fn build_json_response(status: u16, body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| crate::error::ProxyError::Internal.to_response())
}
