//! OpenAI Chat Completions adapter.

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

pub struct OpenAIAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| ProviderKind::OpenAI.default_base_url().to_string()),
        }
    }

    fn request_builder(&self, token: &str, auth: AuthKind) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url));
        apply_auth(ProviderKind::OpenAI, builder, token, auth)
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn build_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": role_str(message.role),
                "content": message.content,
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if stream {
        body["stream"] = json!(true);
        // Without this the final chunk omits usage entirely.
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

fn parse_usage(payload: &Value) -> Usage {
    Usage::new(
        payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    )
}

fn parse_response(payload: &Value) -> (ChatMessage, Usage) {
    let message = &payload["choices"][0]["message"];
    let content = message["content"].as_str().unwrap_or_default().to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|v| v.as_slice())
        .unwrap_or(&[])
        .iter()
        .map(|call| {
            let raw_arguments = call["function"]["arguments"].as_str().unwrap_or_default();
            ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                // Arguments arrive JSON-encoded; keep the raw string when
                // they do not parse.
                arguments: serde_json::from_str(raw_arguments)
                    .unwrap_or_else(|_| Value::String(raw_arguments.to_string())),
            }
        })
        .collect();
    (
        ChatMessage::assistant(content).with_tool_calls(tool_calls),
        parse_usage(payload),
    )
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
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
                        if message.data == "[DONE]" {
                            yield Ok(StreamEvent::Done { usage });
                            break;
                        }
                        let Ok(payload) = serde_json::from_str::<Value>(&message.data) else {
                            continue;
                        };
                        if payload["usage"].is_object() {
                            usage = parse_usage(&payload);
                        }
                        if let Some(content) =
                            payload["choices"][0]["delta"]["content"].as_str()
                        {
                            if !content.is_empty() {
                                yield Ok(StreamEvent::Delta {
                                    content: content.to_string(),
                                });
                            }
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
        send_cancellable(ctx, self.client.get(&self.base_url)).await?;
        Ok(())
    }
}
