//! Deterministic in-process provider for tests.
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{BoxFuture, CompletionRequest, LlmError, LlmProvider};

/// Replays canned responses in order and records every request it saw.
/// When the queue runs dry it keeps returning the final response, so a
/// test can set one answer for a whole batch.
#[derive(Debug, Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        {
            let mut queue = provider.responses.lock().unwrap();
            queue.extend(responses.into_iter().map(Into::into));
        }
        provider
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Requests recorded so far, for prompt assertions.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<String, LlmError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(response) => {
                    *self.last.lock().unwrap() = Some(response.clone());
                    Ok(response)
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| LlmError::InvalidResponse("mock queue empty".to_string())),
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
