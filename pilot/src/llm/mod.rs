//! LLM backend abstraction.
//!
//! The [`LlmBackend`] trait decouples the planner and sub-agents from the
//! wire protocol. [`http`] speaks the Anthropic and OpenAI-compatible APIs,
//! [`router`] adds tier selection, retries and failover on top. Tests use a
//! scripted backend that replays canned responses.

pub mod http;
pub mod router;

use thiserror::Error;

use crate::core::types::{Message, ToolInvocation};
use crate::tools::ToolSpec;

/// One completion request: system prompt, history and advertised tools.
#[derive(Debug, Clone, Copy)]
pub struct LlmRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Model reply: free text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn tools(tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }
}

/// Classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("backend unavailable: {0}")]
    Transient(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    /// Auth, quota, billing, bad request: retrying the same backend will not help.
    #[error("backend rejected request: {0}")]
    Fatal(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Transient(_) | Self::Timeout(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// A chat-completion backend with tool calling.
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the first request of a task.
    fn begin_task(&self, _task_text: &str) {}

    fn complete(&self, request: &LlmRequest<'_>) -> Result<LlmResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::RateLimited("429".into()).is_retryable());
        assert!(LlmError::Transient("502".into()).is_retryable());
        assert!(LlmError::Timeout(30).is_retryable());
        assert!(!LlmError::Fatal("billing".into()).is_retryable());
        assert!(!LlmError::Malformed("no choices".into()).is_retryable());
    }
}
