//! Request-size estimation against per-credential limits
//!
//! The estimate is deliberately coarse: four characters per token plus a
//! fixed overhead. It only has to tell "comfortably within" from "near" and
//! "over" the limit of the active credential kind.

use serde::{Deserialize, Serialize};

/// Characters assumed per token.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Fixed per-request overhead added to every estimate.
pub const REQUEST_OVERHEAD: u64 = 16;

/// Percentage of the limit at which a request counts as near the limit.
pub const NEAR_LIMIT_PERCENT: u64 = 90;

/// What to do when a request approaches or exceeds the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// Log a warning near or over the limit and let the call proceed.
    #[default]
    Warn,
    /// Refuse over-limit requests before any network call.
    Block,
    /// Never check.
    Ignore,
}

/// Where an estimate sits relative to a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeVerdict {
    Within,
    NearLimit,
    Exceeds,
}

impl SizeVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            SizeVerdict::Within => "within",
            SizeVerdict::NearLimit => "near_limit",
            SizeVerdict::Exceeds => "exceeds",
        }
    }
}

/// Approximate token count of the given text parts.
pub fn estimate<S: AsRef<str>>(parts: &[S]) -> u64 {
    let chars: u64 = parts
        .iter()
        .map(|p| p.as_ref().chars().count() as u64)
        .sum();
    chars / CHARS_PER_TOKEN + REQUEST_OVERHEAD
}

/// Classify an estimate against `limit`.
pub fn classify(estimated: u64, limit: u64) -> SizeVerdict {
    if estimated > limit {
        SizeVerdict::Exceeds
    } else if estimated.saturating_mul(100) >= limit.saturating_mul(NEAR_LIMIT_PERCENT) {
        SizeVerdict::NearLimit
    } else {
        SizeVerdict::Within
    }
}

/// Collect the text of a Messages API request body: the system prompt and
/// every text block of every message. Non-text blocks are ignored.
pub fn text_parts(body: &serde_json::Value) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(system) = body.get("system") {
        collect_content(system, &mut parts);
    }
    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content") {
                collect_content(content, &mut parts);
            }
        }
    }
    parts
}

/// Content is either a plain string or an array of typed blocks.
fn collect_content(content: &serde_json::Value, parts: &mut Vec<String>) {
    match content {
        serde_json::Value::String(s) => parts.push(s.clone()),
        serde_json::Value::Array(blocks) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    parts.push(text.to_string());
                } else if let Some(nested) = block.get("content") {
                    // tool_result blocks carry their own content
                    collect_content(nested, parts);
                }
            }
        }
        _ => {}
    }
}
