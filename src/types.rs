//! Provider-neutral chat types shared by the engine, adapters, and API.
//!
//! Clients speak these types; adapters translate them to each provider's
//! wire format. Models are addressed as `provider/model-id` (e.g.
//! `anthropic/claude-sonnet-4-5`).

use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Provider-supplied arguments, passed through verbatim.
    pub arguments: serde_json::Value,
}

/// A single chat message.
///
/// Tool-calling responses carry structured records in `tool_calls`; this is
/// why the engine has a message-valued execution variant instead of
/// stringifying everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Token usage for one request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another usage record into this one (streaming deltas).
    pub fn merge(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Provider-neutral chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// `provider/model-id`, or a bare model id routed to the default provider.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Split `provider/model-id` into its halves, if prefixed.
    pub fn split_model(&self) -> (Option<&str>, &str) {
        match self.model.split_once('/') {
            Some((provider, model)) => (Some(provider), model),
            None => (None, self.model.as_str()),
        }
    }
}

/// Provider-neutral chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub usage: Usage,
    pub model: String,
    pub provider: String,
}

/// One event on a provider-neutral response stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta { content: String },
    /// Terminal event carrying final usage.
    Done { usage: Usage },
}

/// Request options the dispatcher inspects. Opaque to it except `stream`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub stream: bool,
    /// Resolved provider-local model id, carried for adapters and logs.
    pub model: String,
}
