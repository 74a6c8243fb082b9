//! OpenAI-compatible chat completion provider.
//!
//! Works against any endpoint that speaks the `/chat/completions`
//! shape, which covers OpenAI, Ollama, LM Studio, and most proxies.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BoxFuture, CompletionRequest, LlmError, LlmProvider};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "qwen2.5-coder:7b".to_string(),
            max_retries: 2,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

pub struct HttpProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices array".to_string()))
    }
}

fn is_transient(err: &LlmError) -> bool {
    match err {
        LlmError::Http(e) => e.is_timeout() || e.is_connect(),
        LlmError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<String, LlmError>> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match self.complete_once(request).await {
                    Ok(text) => {
                        debug!(model = %self.config.model, chars = text.len(), "LLM completion");
                        return Ok(text);
                    }
                    Err(err) if is_transient(&err) && attempt < self.config.max_retries => {
                        attempt += 1;
                        let backoff = Duration::from_millis(500 * 2u64.pow(attempt));
                        warn!("Transient LLM error (attempt {attempt}): {err}, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&LlmError::Api {
            status: 429,
            message: String::new()
        }));
        assert!(is_transient(&LlmError::Api {
            status: 503,
            message: String::new()
        }));
        assert!(!is_transient(&LlmError::Api {
            status: 401,
            message: String::new()
        }));
        assert!(!is_transient(&LlmError::InvalidResponse(String::new())));
    }

    #[test]
    fn test_url_join_trims_trailing_slash() {
        let config = HttpProviderConfig {
            base_url: "http://localhost:11434/v1/".to_string(),
            ..Default::default()
        };
        let provider = HttpProvider::new(config).unwrap();
        assert_eq!(provider.config.base_url.trim_end_matches('/'), "http://localhost:11434/v1");
    }
}
