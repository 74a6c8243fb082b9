//! LLM provider boundary.
//!
//! Tier-2 verification, Tier-3 discovery, pattern evolution, and the AI
//! link pass all talk to a model through [`LlmProvider`]. The trait
//! returns boxed futures so providers stay object-safe and callers can
//! hold a `dyn` provider behind an `Arc`.
pub mod http;
pub mod mock;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpProvider, HttpProviderConfig};
pub use mock::MockProvider;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),

    #[error("AI features are disabled")]
    Disabled,
}

/// One completion call. Prompts are fully rendered by the caller; the
/// provider only transports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 1024,
            temperature: 0.0,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Run one completion and return the raw model text.
    fn complete<'a>(&'a self, request: &'a CompletionRequest)
        -> BoxFuture<'a, Result<String, LlmError>>;
}

/// Extract a JSON value from model output, tolerating markdown fences
/// and prose around the payload.
pub fn parse_json_response(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();

    // Prefer a fenced block when present.
    let candidate = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => after[..end].trim(),
            None => after.trim(),
        }
    } else {
        trimmed
    };

    if let Ok(value) = serde_json::from_str(candidate) {
        return Ok(value);
    }

    // Fall back to the outermost braces or brackets.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (candidate.find(open), candidate.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&candidate[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(LlmError::InvalidResponse(format!(
        "no JSON payload in model output: {}",
        &text[..text.len().min(200)]
    )))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let v = parse_json_response(r#"{"status": "verified"}"#).unwrap();
        assert_eq!(v["status"], "verified");
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "Here you go:\n```json\n{\"status\": \"rejected\"}\n```\nDone.";
        let v = parse_json_response(text).unwrap();
        assert_eq!(v["status"], "rejected");
    }

    #[test]
    fn test_parse_json_embedded_in_prose() {
        let text = "The answer is {\"nodes\": []} as requested.";
        let v = parse_json_response(text).unwrap();
        assert!(v["nodes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_json_response("no json here at all").is_err());
    }
}
