//! Anthropic ↔ OpenAI protocol bridge.
//!
//! Only engaged when the client's wire format differs from the resolved
//! target provider's format. OpenAI's shape is the canonical intermediate,
//! mirroring the original's LiteLLM-based bridge (`litellm_bridge.py`),
//! which natively speaks OpenAI-shaped messages.

use bytes::Bytes;
use futures::Stream;
use serde_json::{json, Value};

fn trim_trailing_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(0);
    if start >= end {
        &[]
    } else {
        &bytes[start..end]
    }
}

fn anthropic_event(name: &str, payload: &Value) -> Bytes {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {name}\ndata: {data}\n\n"))
}

// ---------------------------------------------------------------------
// Anthropic request -> OpenAI messages
// ---------------------------------------------------------------------

fn system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(blocks) => {
            let joined = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    }
}

fn stringify_tool_result_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Converts an Anthropic-shaped request body into a list of OpenAI chat
/// messages. `tool_use`/`tool_result` blocks flush their own message
/// immediately as encountered (matching the original's interleaving
/// quirk — see the design ledger); accumulated `text` blocks in the same
/// source message flush once, after any such interleaved messages.
pub fn anthropic_to_openai_messages(body: &Value) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(system) = body.get("system") {
        if let Some(text) = system_text(system) {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for msg in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        match msg.get("content").unwrap_or(&Value::Null) {
            Value::String(s) => {
                messages.push(json!({"role": role, "content": s}));
            }
            Value::Array(blocks) => {
                let mut text_parts: Vec<String> = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(Value::as_str) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                            let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                            let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                            let arguments = serde_json::to_string(&input).unwrap_or_default();
                            messages.push(json!({
                                "role": role,
                                "content": Value::Null,
                                "tool_calls": [{
                                    "id": id,
                                    "type": "function",
                                    "function": {"name": name, "arguments": arguments},
                                }],
                            }));
                        }
                        Some("tool_result") => {
                            let tool_use_id =
                                block.get("tool_use_id").and_then(Value::as_str).unwrap_or("");
                            let content = stringify_tool_result_content(
                                block.get("content").unwrap_or(&Value::Null),
                            );
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() {
                    messages.push(json!({"role": role, "content": text_parts.join(" ")}));
                }
            }
            other if !other.is_null() => {
                messages.push(json!({"role": role, "content": other.to_string()}));
            }
            _ => {}
        }
    }

    messages
}

// ---------------------------------------------------------------------
// OpenAI streaming response -> Anthropic SSE
// ---------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct StreamTotals {
    input_tokens: u64,
    output_tokens: u64,
}

fn openai_chunk_to_anthropic_delta(line: &[u8], totals: &mut StreamTotals) -> Option<Bytes> {
    let trimmed = trim_trailing_newline(line);
    let payload = trimmed.strip_prefix(b"data: ")?;
    let payload = trim_ascii_whitespace(payload);
    if payload == b"[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_slice(payload).ok()?;

    if let Some(usage) = value.get("usage") {
        if let Some(completion_tokens) = usage.get("completion_tokens").and_then(Value::as_u64) {
            totals.output_tokens = completion_tokens;
        }
        if let Some(prompt_tokens) = usage.get("prompt_tokens").and_then(Value::as_u64) {
            totals.input_tokens = prompt_tokens;
        }
    }

    let content = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)?;
    if content.is_empty() {
        return None;
    }

    Some(anthropic_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": content},
        }),
    ))
}

/// Synthesizes the canonical Anthropic SSE event sequence
/// (`message_start` → `content_block_start` → N × `content_block_delta` →
/// `content_block_stop` → `message_delta` → `message_stop`) from an OpenAI
/// streaming response. `record_usage` runs once, after the upstream stream
/// ends and before the closing events are emitted — mirroring the
/// teacher's combined transform-and-record stream finalizer — so the
/// caller can fold token accounting into the same pass instead of
/// re-reading the body.
pub fn openai_stream_to_anthropic_sse<F, Fut>(
    inner: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    model: String,
    record_usage: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    F: FnOnce(u64, u64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async_stream::stream! {
        yield Ok(anthropic_event("message_start", &json!({
            "type": "message_start",
            "message": {
                "id": "msg_router",
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "usage": {"input_tokens": 0, "output_tokens": 0},
            },
        })));
        yield Ok(anthropic_event("content_block_start", &json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        })));

        let mut buf = Vec::<u8>::new();
        let mut totals = StreamTotals::default();
        let mut stream = std::pin::pin!(inner);
        while let Some(item) = futures::StreamExt::next(&mut stream).await {
            match item {
                Ok(chunk) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        if let Some(event) = openai_chunk_to_anthropic_delta(&line, &mut totals) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    yield Ok(anthropic_event("error", &json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": e.to_string()},
                    })));
                    break;
                }
            }
        }

        record_usage(totals.input_tokens, totals.output_tokens).await;

        yield Ok(anthropic_event("content_block_stop", &json!({
            "type": "content_block_stop",
            "index": 0,
        })));
        yield Ok(anthropic_event("message_delta", &json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"output_tokens": totals.output_tokens},
        })));
        yield Ok(anthropic_event("message_stop", &json!({"type": "message_stop"})));
    }
}

// ---------------------------------------------------------------------
// OpenAI non-streaming response -> Anthropic body
// ---------------------------------------------------------------------

/// Projects an OpenAI completion response into a single-block Anthropic
/// message body.
pub fn openai_response_to_anthropic(resp: &Value, model: &str) -> Value {
    let mut content = Vec::new();
    if let Some(text) = resp
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }

    let usage = resp.get("usage").cloned().unwrap_or_else(|| json!({}));
    json!({
        "id": resp.get("id").and_then(Value::as_str).unwrap_or("msg_router"),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": "end_turn",
        "usage": {
            "input_tokens": usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            "output_tokens": usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn system_string_becomes_leading_system_message() {
        let body = json!({"system": "be terse", "messages": []});
        let messages = anthropic_to_openai_messages(&body);
        assert_eq!(messages[0], json!({"role": "system", "content": "be terse"}));
    }

    #[test]
    fn system_block_list_concatenates_text_blocks() {
        let body = json!({
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "messages": [],
        });
        let messages = anthropic_to_openai_messages(&body);
        assert_eq!(messages[0], json!({"role": "system", "content": "a b"}));
    }

    #[test]
    fn string_content_passes_through() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let messages = anthropic_to_openai_messages(&body);
        assert_eq!(messages, vec![json!({"role": "user", "content": "hi"})]);
    }

    #[test]
    fn tool_use_flushes_before_trailing_text() {
        let body = json!({
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "call_1", "name": "lookup", "input": {"q": "weather"}},
                    {"type": "text", "text": "done"},
                ],
            }],
        });
        let messages = anthropic_to_openai_messages(&body);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(messages[0]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"weather\"}");
        assert_eq!(messages[1]["content"], "let me check done");
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": "72F and sunny"},
                ],
            }],
        });
        let messages = anthropic_to_openai_messages(&body);
        assert_eq!(
            messages[0],
            json!({"role": "tool", "tool_call_id": "call_1", "content": "72F and sunny"})
        );
    }

    #[test]
    fn non_streaming_response_maps_usage_and_text() {
        let resp = json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 9},
        });
        let anthropic = openai_response_to_anthropic(&resp, "gpt-4o-mini");
        assert_eq!(anthropic["content"][0]["text"], "hello there");
        assert_eq!(anthropic["usage"]["input_tokens"], 5);
        assert_eq!(anthropic["usage"]["output_tokens"], 9);
        assert_eq!(anthropic["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn stream_preserves_concatenated_delta_text() {
        let chunks = vec![
            Ok(Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n".to_string(),
            )),
            Ok(Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n".to_string(),
            )),
            Ok(Bytes::from(
                "data: {\"choices\":[{\"delta\":{}}],\"usage\":{\"completion_tokens\":2}}\n\n"
                    .to_string(),
            )),
            Ok(Bytes::from("data: [DONE]\n\n".to_string())),
        ];
        let input = futures::stream::iter(chunks);
        let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
        let recorded_clone = recorded.clone();
        let out = openai_stream_to_anthropic_sse(input, "gpt-4o".to_string(), move |in_tok, out_tok| {
            let recorded = recorded_clone.clone();
            async move {
                *recorded.lock().unwrap() = Some((in_tok, out_tok));
            }
        });
        let events: Vec<Bytes> = out.map(|r| r.unwrap()).collect().await;
        assert_eq!(*recorded.lock().unwrap(), Some((0, 2)));
        let all = events
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join("");

        assert!(all.contains("event: message_start"));
        assert!(all.contains("\"text\":\"Hel\""));
        assert!(all.contains("\"text\":\"lo\""));
        assert!(all.contains("event: message_stop"));
        assert!(all.contains("\"output_tokens\":2"));

        let mut concatenated = String::new();
        for event in &events {
            let text = String::from_utf8_lossy(event);
            if let Some(data_line) = text.lines().find(|l| l.starts_with("data: ")) {
                if let Ok(v) = serde_json::from_str::<Value>(&data_line[6..]) {
                    if v.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                        if let Some(t) = v["delta"]["text"].as_str() {
                            concatenated.push_str(t);
                        }
                    }
                }
            }
        }
        assert_eq!(concatenated, "Hello");
    }
}
