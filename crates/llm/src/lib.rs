//! LLM provider registry and typed client pool.
//!
//! The provider registry is the single source of truth for both client
//! construction and the credential field list the UI renders; it is
//! serialized verbatim for `providers.list()`. The pool shares one HTTP
//! transport across endpoints and bounds parallelism through the llm gates.
//! Clients are constructed lazily on first use, so OCR credentials are only
//! required when OCR is actually invoked.

use ojforge_models::PipelineError;
use thiserror::Error;

mod client;
mod pool;
mod registry;
pub mod scripted;

pub use client::{Completion, CompletionRequest, HttpProviderClient, ProviderClient};
pub use pool::{CallOptions, LlmEndpoint, LlmPool, LlmReply, TestReport};
pub use registry::{provider, providers, providers_with, user_selectable_providers};
pub use scripted::ScriptedClient;

/// Errors surfaced by LLM calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("network error talking to provider: {0}")]
    TransientNetwork(String),

    #[error("unusable provider response: {0}")]
    BadResponse(String),

    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::TransientNetwork(_) | LlmError::Timeout(_)
        )
    }
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Auth(m) => PipelineError::Auth(m),
            LlmError::RateLimited(m) => PipelineError::RateLimited(m),
            LlmError::TransientNetwork(m) => PipelineError::TransientNetwork(m),
            LlmError::BadResponse(m) => PipelineError::BadData(m),
            LlmError::Timeout(s) => PipelineError::Timeout(format!("llm call after {s}s")),
            LlmError::Cancelled => PipelineError::Cancelled,
        }
    }
}
