//! Static hidden-Unicode scan over request message text.
//!
//! Covers zero-width characters, bidi controls, invisible math operators,
//! soft hyphen, the Arabic letter mark, the byte-order mark, and the tag
//! character plane — the ranges the GLOSSARY enumerates. Two modes: strip
//! (remove and continue) or block (reject, reporting up to 10 offending
//! code points).

use std::ops::RangeInclusive;

use serde_json::Value;

const MAX_REPORTED: usize = 10;

const HIDDEN_RANGES: &[RangeInclusive<u32>] = &[
    0x00AD..=0x00AD,   // soft hyphen
    0x061C..=0x061C,   // Arabic letter mark
    0x200B..=0x200F,   // zero-width space/non-joiner/joiner, directional marks
    0x202A..=0x202E,   // bidi embedding/override controls
    0x2060..=0x2064,   // word joiner, invisible separator/plus/times/operator
    0x2066..=0x2069,   // bidi isolates
    0xFEFF..=0xFEFF,   // BOM / zero-width no-break space
    0xE0000..=0xE007F, // tag characters
];

pub fn is_hidden(c: char) -> bool {
    let cp = c as u32;
    HIDDEN_RANGES.iter().any(|r| r.contains(&cp))
}

/// Removes every hidden code point from `text`. Idempotent: stripping an
/// already-stripped string is a no-op.
pub fn strip_text(text: &str) -> String {
    text.chars().filter(|&c| !is_hidden(c)).collect()
}

fn offending_in(text: &str, out: &mut Vec<char>) {
    for c in text.chars() {
        if out.len() >= MAX_REPORTED {
            return;
        }
        if is_hidden(c) {
            out.push(c);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    Strip,
    Block,
}

#[derive(Debug)]
pub enum GuardOutcome {
    Passed,
    Blocked(Vec<char>),
}

/// Applies the configured mode to `body`'s `system`/`messages[].content`
/// text fields. Strip mode mutates `body` in place and always passes;
/// block mode leaves `body` untouched and reports up to 10 offending code
/// points if any are found.
pub fn apply(mode: GuardMode, body: &mut Value) -> GuardOutcome {
    match mode {
        GuardMode::Strip => {
            strip_in_place(body);
            GuardOutcome::Passed
        }
        GuardMode::Block => {
            let mut offending = Vec::new();
            for text in collect_texts(body) {
                offending_in(text, &mut offending);
                if offending.len() >= MAX_REPORTED {
                    break;
                }
            }
            if offending.is_empty() {
                GuardOutcome::Passed
            } else {
                GuardOutcome::Blocked(offending)
            }
        }
    }
}

/// Owned copies of every system/message text field, for handing to the
/// external content guard after the hidden-Unicode pass has run.
pub fn extract_message_texts(body: &Value) -> Vec<String> {
    collect_texts(body).into_iter().map(str::to_string).collect()
}

fn collect_texts(body: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    if let Some(system) = body.get("system") {
        collect_from_system(system, &mut out);
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for msg in messages {
            if let Some(content) = msg.get("content") {
                collect_from_content(content, &mut out);
            }
        }
    }
    out
}

fn collect_from_system<'a>(system: &'a Value, out: &mut Vec<&'a str>) {
    match system {
        Value::String(s) => out.push(s),
        Value::Array(blocks) => {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        out.push(t);
                    }
                }
            }
        }
        _ => {}
    }
}

fn collect_from_content<'a>(content: &'a Value, out: &mut Vec<&'a str>) {
    match content {
        Value::String(s) => out.push(s),
        Value::Array(blocks) => {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        out.push(t);
                    }
                }
            }
        }
        _ => {}
    }
}

fn strip_in_place(body: &mut Value) {
    if let Some(system) = body.get_mut("system") {
        strip_system(system);
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for msg in messages {
            if let Some(content) = msg.get_mut("content") {
                strip_content(content);
            }
        }
    }
}

fn strip_system(system: &mut Value) {
    match system {
        Value::String(s) => *s = strip_text(s),
        Value::Array(blocks) => strip_text_blocks(blocks),
        _ => {}
    }
}

fn strip_content(content: &mut Value) {
    match content {
        Value::String(s) => *s = strip_text(s),
        Value::Array(blocks) => strip_text_blocks(blocks),
        _ => {}
    }
}

fn strip_text_blocks(blocks: &mut [Value]) {
    for block in blocks {
        if block.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(Value::String(s)) = block.get_mut("text") {
            *s = strip_text(s);
        }
    }
}
