//! Defensive parsing of backend replies.
//!
//! Local models wrap JSON in reasoning blocks, markdown fences or chatty
//! prose. These helpers peel all of that off before `serde_json` sees it.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// A reply that could not be turned into the expected structure.
#[derive(Debug, Clone, Error)]
#[error("malformed reply: {reason}")]
pub struct ParseError {
    pub reason: String,
}

/// Remove `<think>...</think>` reasoning annotations.
///
/// A dangling `</think>` with no opener drops everything before it; a
/// dangling `<think>` drops everything after it.
pub fn strip_reasoning(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    if !rest.contains("<think>") {
        if let Some(end) = rest.find("</think>") {
            rest = &rest[end + "</think>".len()..];
        }
    }

    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "<think>".len()..];
        match after.find("</think>") {
            Some(end) => rest = &after[end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Extract the JSON payload from a reply that might have fences or prose around it.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if text.starts_with('{') || text.starts_with('[') {
        return text;
    }

    // JSON object embedded in prose
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Strip reasoning, extract the JSON payload and deserialize it.
pub fn parse_structured<T: DeserializeOwned>(reply: &str) -> Result<T, ParseError> {
    let cleaned = strip_reasoning(reply);
    let json = extract_json(&cleaned);
    serde_json::from_str(json).map_err(|e| ParseError {
        reason: format!("{e}: {}", truncate(json, 200)),
    })
}

/// Strip reasoning from a prose reply.
pub fn clean_prose(reply: &str) -> String {
    strip_reasoning(reply)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
