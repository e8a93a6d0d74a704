//! Reasoning capability used by chorus agents: a provider trait, an HTTP
//! implementation and a scriptable mock.

pub mod http;
pub mod provider;

pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, MockProvider, Role};
