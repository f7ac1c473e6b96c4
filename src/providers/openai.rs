//! OpenAI-compatible adapter. Inbound Anthropic Messages requests are
//! translated to the chat-completions schema; responses (streaming and not)
//! are translated back to the Anthropic wire shape before reaching the
//! client.

use serde_json::{Map, Value, json};

use super::{
    InboundRequest, OutboundRequest, Provider, RateLimitSignal, StreamTranslator, TokenUsage,
    model_map, parse_retry_after,
};
use crate::accounts::{Account, ProviderKind};
use crate::error::ProxyError;

pub struct OpenAiCompatProvider;

impl OpenAiCompatProvider {
    pub const fn new() -> Self {
        Self
    }
}

// ---------------------------------------------------------------------------
// Request translation: Anthropic Messages → OpenAI chat completions
// ---------------------------------------------------------------------------

fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn block_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Convert one Anthropic message into one or more OpenAI messages.
/// tool_result blocks become standalone `tool` role messages.
fn convert_message(msg: &Value, out: &mut Vec<Value>) {
    let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
    let content = msg.get("content").cloned().unwrap_or(Value::Null);

    match &content {
        Value::String(text) => {
            out.push(json!({"role": role, "content": text}));
        }
        Value::Array(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(t.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let arguments = block
                            .get("input")
                            .map(|i| serde_json::to_string(i).unwrap_or_default())
                            .unwrap_or_else(|| "{}".to_string());
                        tool_calls.push(json!({
                            "id": block.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                                "arguments": arguments
                            }
                        }));
                    }
                    Some("tool_result") => {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": block.get("tool_use_id").and_then(|i| i.as_str()).unwrap_or(""),
                            "content": block_text(block.get("content").unwrap_or(&Value::Null))
                        }));
                    }
                    _ => {}
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                let mut m = Map::new();
                m.insert("role".into(), Value::String(role.to_string()));
                m.insert(
                    "content".into(),
                    if text_parts.is_empty() {
                        Value::Null
                    } else {
                        Value::String(text_parts.join(""))
                    },
                );
                if !tool_calls.is_empty() {
                    m.insert("tool_calls".into(), Value::Array(tool_calls));
                }
                out.push(Value::Object(m));
            }
        }
        _ => {}
    }
}

/// Build the chat-completions body from an Anthropic Messages body.
pub fn anthropic_to_openai_request(body: &Value, model: &str, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = body.get("system") {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    if let Some(msgs) = body.get("messages").and_then(|m| m.as_array()) {
        for msg in msgs {
            convert_message(msg, &mut messages);
        }
    }

    let mut out = Map::new();
    out.insert("model".into(), Value::String(model.to_string()));
    out.insert("messages".into(), Value::Array(messages));

    if let Some(max_tokens) = body.get("max_tokens") {
        out.insert("max_tokens".into(), max_tokens.clone());
    }
    if let Some(temperature) = body.get("temperature") {
        out.insert("temperature".into(), temperature.clone());
    }
    if let Some(top_p) = body.get("top_p") {
        out.insert("top_p".into(), top_p.clone());
    }
    if let Some(stops) = body.get("stop_sequences") {
        out.insert("stop".into(), stops.clone());
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(json!({}))
                    }
                })
            })
            .collect();
        out.insert("tools".into(), Value::Array(converted));
    }

    if let Some(choice) = body.get("tool_choice") {
        let converted = match choice.get("type").and_then(|t| t.as_str()) {
            Some("any") => json!("required"),
            Some("tool") => json!({
                "type": "function",
                "function": {"name": choice.get("name").cloned().unwrap_or(Value::Null)}
            }),
            _ => json!("auto"),
        };
        out.insert("tool_choice".into(), converted);
    }

    if stream {
        out.insert("stream".into(), Value::Bool(true));
        // Ask compatible backends to put usage on the final chunk.
        out.insert("stream_options".into(), json!({"include_usage": true}));
    }

    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Response translation: chat completion → Anthropic message
// ---------------------------------------------------------------------------

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Usage layouts vary across compatible backends; only take what is present.
fn usage_from_openai(usage: &Value) -> TokenUsage {
    let get = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    TokenUsage {
        input_tokens: get("prompt_tokens"),
        output_tokens: get("completion_tokens"),
        cache_read_input_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_input_tokens: 0,
        partial: false,
    }
}

fn translate_full_response(body: &Value, model: &str) -> Value {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        && !text.is_empty()
    {
        content.push(json!({"type": "text", "text": text}));
    }
    if let Some(calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|c| c.as_array())
    {
        for call in calls {
            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.get("function").and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                "input": input
            }));
        }
    }

    let stop_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(map_finish_reason)
        .unwrap_or("end_turn");

    let usage = body.get("usage").map(usage_from_openai).unwrap_or_default();

    json!({
        "id": body.get("id").cloned().unwrap_or_else(|| json!("msg_translated")),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_read_input_tokens": usage.cache_read_input_tokens,
            "cache_creation_input_tokens": usage.cache_creation_input_tokens
        }
    })
}

// ---------------------------------------------------------------------------
// Streaming translator
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum OpenBlock {
    None,
    Text,
    ToolUse,
}

pub struct OpenAiStreamTranslator {
    model: String,
    started: bool,
    block: OpenBlock,
    block_index: u32,
    usage: TokenUsage,
    stop_reason: Option<&'static str>,
}

impl OpenAiStreamTranslator {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            started: false,
            block: OpenBlock::None,
            block_index: 0,
            usage: TokenUsage::default(),
            stop_reason: None,
        }
    }

    fn frame(event: &Value) -> String {
        format!("data: {event}\n\n")
    }

    fn close_block(&mut self, out: &mut Vec<String>) {
        if self.block != OpenBlock::None {
            out.push(Self::frame(&json!({
                "type": "content_block_stop",
                "index": self.block_index
            })));
            self.block_index += 1;
            self.block = OpenBlock::None;
        }
    }

    fn ensure_started(&mut self, id: &str, out: &mut Vec<String>) {
        if !self.started {
            self.started = true;
            out.push(Self::frame(&json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            })));
        }
    }
}

impl StreamTranslator for OpenAiStreamTranslator {
    fn translate(&mut self, frame: &Value) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(usage) = frame.get("usage")
            && !usage.is_null()
        {
            self.usage.merge(&usage_from_openai(usage));
        }

        let id = frame.get("id").and_then(|i| i.as_str()).unwrap_or("msg_stream");
        let Some(choice) = frame
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return out;
        };
        self.ensure_started(id, &mut out);

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str())
                && !text.is_empty()
            {
                if self.block == OpenBlock::ToolUse {
                    self.close_block(&mut out);
                }
                if self.block == OpenBlock::None {
                    self.block = OpenBlock::Text;
                    out.push(Self::frame(&json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {"type": "text", "text": ""}
                    })));
                }
                out.push(Self::frame(&json!({
                    "type": "content_block_delta",
                    "index": self.block_index,
                    "delta": {"type": "text_delta", "text": text}
                })));
            }

            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let function = call.get("function");
                    let name = function.and_then(|f| f.get("name")).and_then(|n| n.as_str());
                    if let Some(name) = name {
                        // New tool call opens a fresh block
                        self.close_block(&mut out);
                        self.block = OpenBlock::ToolUse;
                        out.push(Self::frame(&json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": call.get("id").cloned().unwrap_or(json!("")),
                                "name": name,
                                "input": {}
                            }
                        })));
                    }
                    if let Some(args) = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|a| a.as_str())
                        && !args.is_empty()
                        && self.block == OpenBlock::ToolUse
                    {
                        out.push(Self::frame(&json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {"type": "input_json_delta", "partial_json": args}
                        })));
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.stop_reason = Some(map_finish_reason(reason));
            self.close_block(&mut out);
        }

        out
    }

    fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.started {
            return out;
        }
        self.close_block(&mut out);
        out.push(Self::frame(&json!({
            "type": "message_delta",
            "delta": {"stop_reason": self.stop_reason.unwrap_or("end_turn"), "stop_sequence": Value::Null},
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_read_input_tokens": self.usage.cache_read_input_tokens,
                "cache_creation_input_tokens": self.usage.cache_creation_input_tokens
            }
        })));
        out.push(Self::frame(&json!({"type": "message_stop"})));
        out
    }
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

impl Provider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiCompatible
    }

    fn prepare_request(
        &self,
        inbound: &InboundRequest,
        account: &Account,
        credential: &str,
    ) -> Result<OutboundRequest, ProxyError> {
        let base = account
            .custom_endpoint
            .as_deref()
            .ok_or_else(|| {
                ProxyError::Validation(format!(
                    "account {} has no custom endpoint configured",
                    account.name
                ))
            })?
            .trim_end_matches('/');
        let url = format!("{base}/v1/chat/completions");

        let inbound_model = inbound
            .model()
            .ok_or_else(|| ProxyError::Validation("missing model field".into()))?;
        let model = model_map::map_model(
            account.model_mappings.as_ref(),
            inbound_model,
            self.kind(),
        );

        let body = anthropic_to_openai_request(&inbound.body, &model, inbound.stream);

        let headers: Vec<(&'static str, String)> = vec![
            ("content-type", "application/json".to_string()),
            (
                "accept",
                if inbound.stream {
                    "text/event-stream".to_string()
                } else {
                    "application/json".to_string()
                },
            ),
            ("authorization", format!("Bearer {credential}")),
        ];

        Ok(OutboundRequest {
            url,
            headers,
            body,
            model,
        })
    }

    fn parse_usage(&self, frame: &Value) -> TokenUsage {
        frame
            .get("usage")
            .filter(|u| !u.is_null())
            .map(usage_from_openai)
            .unwrap_or_default()
    }

    fn parse_rate_limit(
        &self,
        headers: &reqwest::header::HeaderMap,
        _status: u16,
    ) -> RateLimitSignal {
        let remaining = headers
            .get("x-ratelimit-remaining-requests")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        // Reset headers come in "30" or "30s" flavors depending on backend
        let reset_secs = headers
            .get("x-ratelimit-reset-requests")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().trim_end_matches('s'))
            .and_then(|s| s.parse::<u64>().ok());

        RateLimitSignal {
            remaining,
            reset_at: None,
            retry_after_ms: parse_retry_after(headers).or(reset_secs.map(|s| s * 1000)),
            status: None,
        }
    }

    fn stream_translator(&self, model: &str) -> Option<Box<dyn StreamTranslator>> {
        Some(Box::new(OpenAiStreamTranslator::new(model)))
    }

    fn translate_response(&self, body: &Value, model: &str) -> Option<Value> {
        Some(translate_full_response(body, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::test_account;

    #[test]
    fn test_request_translation_system_and_tools() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "calling"},
                    {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "found"}
                ]}
            ],
            "tools": [{"name": "lookup", "description": "d", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        });

        let out = anthropic_to_openai_request(&body, "gpt-4o", true);
        let messages = out["messages"].as_array().unwrap();

        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "tu_1");
        assert_eq!(out["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(out["tool_choice"], "required");
        assert_eq!(out["stream_options"]["include_usage"], true);
        assert_eq!(out["model"], "gpt-4o");
    }

    #[test]
    fn test_full_response_translation() {
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "hello",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "lookup", "arguments": "{\"q\":1}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3,
                      "prompt_tokens_details": {"cached_tokens": 2}}
        });

        let translated = translate_full_response(&body, "claude-sonnet-4-5");
        assert_eq!(translated["type"], "message");
        assert_eq!(translated["model"], "claude-sonnet-4-5");
        assert_eq!(translated["content"][0]["text"], "hello");
        assert_eq!(translated["content"][1]["type"], "tool_use");
        assert_eq!(translated["content"][1]["input"]["q"], 1);
        assert_eq!(translated["stop_reason"], "tool_use");
        assert_eq!(translated["usage"]["input_tokens"], 7);
        assert_eq!(translated["usage"]["cache_read_input_tokens"], 2);
    }

    #[test]
    fn test_stream_translator_text_roundtrip() {
        let mut tr = OpenAiStreamTranslator::new("claude-sonnet-4-5");

        let first = tr.translate(&json!({
            "id": "c1",
            "choices": [{"delta": {"role": "assistant", "content": "Hel"}}]
        }));
        // message_start, content_block_start, content_block_delta
        assert_eq!(first.len(), 3);
        assert!(first[0].contains("message_start"));
        assert!(first[2].contains("Hel"));

        let more = tr.translate(&json!({
            "id": "c1",
            "choices": [{"delta": {"content": "lo"}}]
        }));
        assert_eq!(more.len(), 1);

        let fin = tr.translate(&json!({
            "id": "c1",
            "choices": [{"delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2}
        }));
        assert!(fin.iter().any(|f| f.contains("content_block_stop")));

        let end = tr.finish();
        assert!(end[0].contains("message_delta"));
        assert!(end[0].contains("\"output_tokens\":2"));
        assert!(end[0].contains("end_turn"));
        assert!(end[1].contains("message_stop"));
    }

    #[test]
    fn test_stream_translator_tool_call() {
        let mut tr = OpenAiStreamTranslator::new("m");
        let events = tr.translate(&json!({
            "id": "c1",
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "lookup", "arguments": ""}}
            ]}}]
        }));
        assert!(events.iter().any(|e| e.contains("tool_use")));

        let args = tr.translate(&json!({
            "id": "c1",
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"q\":"}}
            ]}}]
        }));
        assert!(args[0].contains("input_json_delta"));
    }

    #[test]
    fn test_request_translation_tool_choice_specific() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": {"type": "tool", "name": "lookup"}
        });
        let out = anthropic_to_openai_request(&body, "m", false);
        assert_eq!(out["tool_choice"]["function"]["name"], "lookup");
        assert!(out.get("stream").is_none());
        assert!(out.get("stream_options").is_none());
    }

    #[test]
    fn test_request_translation_system_blocks_join() {
        let body = json!({
            "model": "m",
            "system": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"}
            ],
            "messages": []
        });
        let out = anthropic_to_openai_request(&body, "m", false);
        assert_eq!(out["messages"][0]["content"], "one\ntwo");
    }

    #[test]
    fn test_response_translation_tolerates_empty_choices() {
        let translated = translate_full_response(&json!({"choices": []}), "m");
        assert_eq!(translated["content"].as_array().unwrap().len(), 0);
        assert_eq!(translated["stop_reason"], "end_turn");
        assert_eq!(translated["usage"]["input_tokens"], 0);
    }

    #[test]
    fn test_stream_translator_ignores_pre_start_noise() {
        let mut tr = OpenAiStreamTranslator::new("m");
        // A usage-only frame with no choices must not emit events
        let events = tr.translate(&json!({"usage": {"prompt_tokens": 3}}));
        assert!(events.is_empty());
        // And a never-started stream finishes silently
        assert!(tr.finish().is_empty());
    }

    #[test]
    fn test_prepare_request_requires_endpoint() {
        let account = test_account("a", ProviderKind::OpenaiCompatible);
        let inbound = InboundRequest {
            method: "POST".into(),
            path: "/v1/messages".into(),
            body: json!({"model": "gpt-4o"}),
            stream: false,
        };
        let provider = OpenAiCompatProvider::new();
        assert!(provider.prepare_request(&inbound, &account, "k").is_err());
    }

    #[test]
    fn test_usage_detection_tolerates_absence() {
        let provider = OpenAiCompatProvider::new();
        assert!(provider.parse_usage(&json!({"choices": []})).is_empty());
        assert!(provider.parse_usage(&json!({"usage": null})).is_empty());
        let u = provider.parse_usage(&json!({"usage": {"prompt_tokens": 5}}));
        assert_eq!(u.input_tokens, 5);
        assert_eq!(u.output_tokens, 0);
    }
}
