//! Anthropic Messages API adapter.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde_json::{json, Value};

use crate::context::{AuthKind, RequestContext};
use crate::error::ProviderError;
use crate::providers::{
    apply_auth, response_error, send_cancellable, ChatStream, ProviderAdapter, ProviderKind,
};
use crate::types::{ChatMessage, ChatRequest, Role, StreamEvent, ToolCall, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`; used when the caller omits it.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| ProviderKind::Anthropic.default_base_url().to_string()),
        }
    }

    fn request_builder(&self, token: &str, auth: AuthKind) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION);
        apply_auth(ProviderKind::Anthropic, builder, token, auth)
    }
}

/// Translate the neutral request. System messages move to the top-level
/// `system` field; tool-role messages are folded into user turns.
fn build_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(&message.content),
            Role::Assistant => messages.push(json!({
                "role": "assistant",
                "content": message.content,
            })),
            Role::User | Role::Tool => messages.push(json!({
                "role": "user",
                "content": message.content,
            })),
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn parse_response(payload: &Value) -> (ChatMessage, Usage) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let blocks = payload["content"]
        .as_array()
        .map(|v| v.as_slice())
        .unwrap_or(&[]);
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }
    let usage = Usage::new(
        payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
        payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
    );
    (
        ChatMessage::assistant(content).with_tool_calls(tool_calls),
        usage,
    )
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        model: &str,
        token: &str,
        auth: AuthKind,
    ) -> Result<(ChatMessage, Usage), ProviderError> {
        let body = build_body(request, model, false);
        let response =
            send_cancellable(ctx, self.request_builder(token, auth).json(&body)).await?;
        if !response.status().is_success() {
            return Err(response_error(response).await);
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::network_error(e.to_string()))?;
        Ok(parse_response(&payload))
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        model: &str,
        token: &str,
        auth: AuthKind,
    ) -> Result<ChatStream, ProviderError> {
        let body = build_body(request, model, true);
        let mut source = self
            .request_builder(token, auth)
            .json(&body)
            .eventsource()
            .map_err(|e| ProviderError::network_error(e.to_string()))?;
        let ctx = ctx.clone();

        let stream = async_stream::stream! {
            let mut usage = Usage::default();
            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => None,
                    event = source.next() => Some(event),
                };
                let Some(event) = next else {
                    yield Err(ProviderError::cancelled());
                    break;
                };
                let Some(event) = event else { break };
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&message.data) else {
                            continue;
                        };
                        match payload["type"].as_str() {
                            Some("message_start") => {
                                usage.input_tokens = payload["message"]["usage"]["input_tokens"]
                                    .as_u64()
                                    .unwrap_or(0);
                            }
                            Some("content_block_delta") => {
                                if let Some(text) = payload["delta"]["text"].as_str() {
                                    yield Ok(StreamEvent::Delta {
                                        content: text.to_string(),
                                    });
                                }
                            }
                            Some("message_delta") => {
                                if let Some(output) =
                                    payload["usage"]["output_tokens"].as_u64()
                                {
                                    usage.output_tokens = output;
                                }
                            }
                            Some("message_stop") => {
                                yield Ok(StreamEvent::Done { usage });
                                break;
                            }
                            _ => {}
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(_status, response)) => {
                        yield Err(response_error(response).await);
                        break;
                    }
                    Err(error) => {
                        yield Err(ProviderError::network_error(error.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn check_reachable(&self, ctx: &RequestContext) -> Result<(), ProviderError> {
        // Any HTTP response means the service is reachable; auth is not
        // part of this probe.
        send_cancellable(ctx, self.client.get(&self.base_url)).await?;
        Ok(())
    }
}
