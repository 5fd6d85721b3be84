//! Scripted provider client for tests.

use crate::client::{Completion, CompletionRequest, ProviderClient};
use crate::LlmError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Replays queued responses, falling back to a fixed default. Records every
/// prompt it sees.
pub struct ScriptedClient {
    default: String,
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn always(text: &str) -> Self {
        Self {
            default: text.to_string(),
            queue: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, response: Result<String, LlmError>) {
        self.queue.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt);
        let next = self.queue.lock().unwrap().pop_front();
        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => self.default.clone(),
        };
        Ok(Completion {
            tokens: text.len() as u64,
            latency_ms: 1,
            text,
        })
    }
}
