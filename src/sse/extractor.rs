//! Stateful incremental SSE usage extractor.
//!
//! Fed arbitrary byte chunks as they pass through the proxy; maintains a
//! line buffer that carries a trailing partial line across `feed()` calls,
//! splits on `\n`, and parses only the lines that look like `data: {...}`
//! payloads. A substring fast-filter (`"usage"` / `"model"`) skips the JSON
//! parse for lines that can't possibly carry what we're after — a
//! throughput optimization, not a correctness constraint. Any per-line
//! parse error is swallowed: partial extraction is fine, corrupting the
//! relayed byte stream is not.

use serde_json::Value;

const DATA_PREFIX: &[u8] = b"data: ";
const DONE_SENTINEL: &[u8] = b"[DONE]";

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn trim_trailing_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

#[derive(Debug, Default)]
pub struct UsageExtractor {
    buf: Vec<u8>,
    input_tokens: u64,
    output_tokens: u64,
    model: Option<String>,
}

impl UsageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk of raw upstream bytes, processing every
    /// complete line and retaining any trailing partial line for the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.process_line(&line);
        }
    }

    /// Flushes any residual partial line. Call once after the stream ends.
    pub fn finalize(&mut self) {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let trimmed = trim_trailing_newline(line);
        let Some(payload) = trimmed.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = trim_ascii_whitespace(payload);
        if payload == DONE_SENTINEL {
            return;
        }
        if !contains_subslice(payload, b"\"usage\"") && !contains_subslice(payload, b"\"model\"") {
            return;
        }
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        self.accumulate(&value);
    }

    fn accumulate(&mut self, value: &Value) {
        let event_type = value.get("type").and_then(Value::as_str);

        if event_type == Some("message_start") {
            if let Some(message) = value.get("message") {
                if let Some(usage) = message.get("usage") {
                    self.input_tokens += usage_field(usage, "input_tokens");
                    self.input_tokens += usage_field(usage, "cache_read_input_tokens");
                    self.input_tokens += usage_field(usage, "cache_creation_input_tokens");
                }
                self.record_model_once(message.get("model"));
            }
            return;
        }

        if event_type == Some("message_delta") {
            if let Some(usage) = value.get("usage") {
                self.output_tokens += usage_field(usage, "output_tokens");
            }
            return;
        }

        // OpenAI's final stream chunk carries a top-level `usage` object
        // with `prompt_tokens`; earlier chunks either omit `usage` or (in
        // some providers) send it as `null`.
        if let Some(usage) = value.get("usage") {
            if usage.get("prompt_tokens").is_some() {
                self.input_tokens += usage_field(usage, "prompt_tokens");
                self.output_tokens += usage_field(usage, "completion_tokens");
                self.record_model_once(value.get("model"));
            }
        }
    }

    fn record_model_once(&mut self, candidate: Option<&Value>) {
        if self.model.is_some() {
            return;
        }
        if let Some(m) = candidate.and_then(Value::as_str) {
            self.model = Some(m.to_string());
        }
    }

    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

fn usage_field(usage: &Value, field: &str) -> u64 {
    usage.get(field).and_then(Value::as_u64).unwrap_or(0)
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
