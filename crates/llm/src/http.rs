//! HTTP provider for hosted models.
//!
//! Two wire dialects are spoken: the OpenAI-compatible chat-completions API
//! (which most hosted and self-hosted gateways accept) and Anthropic's
//! Messages API. The dialect follows from the model name unless
//! `CHORUS_LLM_API` pins it.

use crate::provider::{CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request/response dialect of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    ChatCompletions,
    AnthropicMessages,
}

impl WireFormat {
    /// `claude-*` models speak Anthropic Messages; everything else is
    /// assumed OpenAI-compatible.
    pub fn for_model(model: &str) -> Self {
        if model.to_ascii_lowercase().starts_with("claude-") {
            Self::AnthropicMessages
        } else {
            Self::ChatCompletions
        }
    }

    /// Explicit override: `openai` / `anthropic`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "chat" | "chat_completions" => Some(Self::ChatCompletions),
            "anthropic" | "messages" => Some(Self::AnthropicMessages),
            _ => None,
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::ChatCompletions => "https://api.openai.com/v1",
            Self::AnthropicMessages => "https://api.anthropic.com",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/chat/completions",
            Self::AnthropicMessages => "/v1/messages",
        }
    }
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Turn<'a>>,
}

#[derive(Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

/// Only text blocks carry the answer; thinking and tool blocks are ignored.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Ignored,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Provider talking to a remote model over HTTPS.
pub struct HttpProvider {
    wire: WireFormat,
    model: String,
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let wire = WireFormat::for_model(&model);
        Self::with_wire(wire, model, api_key, base_url)
    }

    pub fn with_wire(wire: WireFormat, model: String, api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| wire.default_base_url().to_owned());
        let url = format!("{}{}", base.trim_end_matches('/'), wire.path());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { wire, model, api_key, url, client }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn wire(&self) -> WireFormat {
        self.wire
    }

    async fn send<B: Serialize, R: DeserializeOwned>(&self, body: &B) -> Result<R, LlmError> {
        let builder = self.client.post(&self.url).json(body);
        let builder = match self.wire {
            WireFormat::ChatCompletions => builder.bearer_auth(&self.api_key),
            WireFormat::AnthropicMessages => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };
        let resp = builder.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), model = %self.model, "llm request rejected");
            return Err(classify_status(status, detail));
        }
        resp.json::<R>()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("malformed response: {e}")))
    }

    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatBody {
            model: &self.model,
            messages: request.messages.iter().map(|m| turn(m.role, &m.content)).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let reply: ChatReply = self.send(&body).await?;
        let content = reply
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .unwrap_or_default();
        let usage = reply.usage.map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
        Ok(CompletionResponse {
            content,
            input_tokens: usage.0,
            output_tokens: usage.1,
        })
    }

    async fn messages(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, rest): (Vec<_>, Vec<_>) = request.messages.iter().partition(|m| m.role == Role::System);
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });
        let body = MessagesBody {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system,
            messages: rest.into_iter().map(|m| turn(m.role, &m.content)).collect(),
        };
        let reply: MessagesReply = self.send(&body).await?;
        Ok(CompletionResponse {
            content: text_of(reply.content),
            input_tokens: reply.usage.as_ref().map_or(0, |u| u.input_tokens),
            output_tokens: reply.usage.as_ref().map_or(0, |u| u.output_tokens),
        })
    }
}

fn turn(role: Role, content: &str) -> Turn<'_> {
    let role = match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    Turn { role, content }
}

fn text_of(blocks: Vec<ContentBlock>) -> String {
    blocks
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Ignored => None,
        })
        .collect()
}

fn classify_transport(e: reqwest::Error) -> LlmError {
    if e.is_connect() || e.is_timeout() {
        LlmError::Unavailable(e.to_string())
    } else {
        LlmError::RequestFailed(e.to_string())
    }
}

/// 429 is rate limiting, 5xx means the backend is down, anything else is
/// a rejected request.
fn classify_status(status: reqwest::StatusCode, detail: String) -> LlmError {
    match status.as_u16() {
        429 => LlmError::RateLimited,
        500..=599 => LlmError::Unavailable(format!("{status}: {detail}")),
        _ => LlmError::RequestFailed(format!("{status}: {detail}")),
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        match self.wire {
            WireFormat::ChatCompletions => "chat-completions",
            WireFormat::AnthropicMessages => "anthropic",
        }
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        match self.wire {
            WireFormat::ChatCompletions => Box::pin(self.chat(request)),
            WireFormat::AnthropicMessages => Box::pin(self.messages(request)),
        }
    }
}

/// Provider configured by `CHORUS_LLM_MODEL` and `CHORUS_LLM_API_KEY`, with
/// optional `CHORUS_LLM_BASE_URL` and `CHORUS_LLM_API`. `None` when model or
/// key is missing.
pub fn from_env() -> Option<HttpProvider> {
    let model = std::env::var("CHORUS_LLM_MODEL").ok()?;
    let api_key = std::env::var("CHORUS_LLM_API_KEY").ok()?;
    let base_url = std::env::var("CHORUS_LLM_BASE_URL").ok();
    let wire = match std::env::var("CHORUS_LLM_API") {
        Ok(raw) => WireFormat::parse(&raw).unwrap_or_else(|| {
            tracing::warn!(value = %raw, "unknown CHORUS_LLM_API, inferring from model");
            WireFormat::for_model(&model)
        }),
        Err(_) => WireFormat::for_model(&model),
    };
    Some(HttpProvider::with_wire(wire, model, api_key, base_url))
}
