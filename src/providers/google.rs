//! Google Generative Language API adapter.

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

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| ProviderKind::Google.default_base_url().to_string()),
        }
    }

    fn request_builder(
        &self,
        model: &str,
        streaming: bool,
        token: &str,
        auth: AuthKind,
    ) -> reqwest::RequestBuilder {
        let endpoint = if streaming {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            )
        } else {
            format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
        };
        apply_auth(ProviderKind::Google, self.client.post(endpoint), token, auth)
    }
}

/// Gemini speaks `user`/`model` roles and takes the system prompt as a
/// separate `systemInstruction`.
fn build_body(request: &ChatRequest) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut contents = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(&message.content),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": [{"text": message.content}],
            })),
            Role::User | Role::Tool => contents.push(json!({
                "role": "user",
                "parts": [{"text": message.content}],
            })),
        }
    }

    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{"text": system_parts.join("\n\n")}],
        });
    }
    let mut generation_config = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    body
}

fn parse_usage(payload: &Value) -> Usage {
    Usage::new(
        payload["usageMetadata"]["promptTokenCount"]
            .as_u64()
            .unwrap_or(0),
        payload["usageMetadata"]["candidatesTokenCount"]
            .as_u64()
            .unwrap_or(0),
    )
}

fn parse_response(payload: &Value) -> (ChatMessage, Usage) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let parts = payload["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|v| v.as_slice())
        .unwrap_or(&[]);
    for part in parts {
        if let Some(text) = part["text"].as_str() {
            content.push_str(text);
        }
        if part["functionCall"].is_object() {
            let name = part["functionCall"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            tool_calls.push(ToolCall {
                // Gemini does not issue call ids; the name stands in.
                id: name.clone(),
                name,
                arguments: part["functionCall"]["args"].clone(),
            });
        }
    }
    (
        ChatMessage::assistant(content).with_tool_calls(tool_calls),
        parse_usage(payload),
    )
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn complete(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        model: &str,
        token: &str,
        auth: AuthKind,
    ) -> Result<(ChatMessage, Usage), ProviderError> {
        let body = build_body(request);
        let response = send_cancellable(
            ctx,
            self.request_builder(model, false, token, auth).json(&body),
        )
        .await?;
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
        let body = build_body(request);
        let mut source = self
            .request_builder(model, true, token, auth)
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
                let Some(event) = event else {
                    // Gemini streams end without a terminal marker.
                    yield Ok(StreamEvent::Done { usage });
                    break;
                };
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&message.data) else {
                            continue;
                        };
                        if payload["usageMetadata"].is_object() {
                            usage = parse_usage(&payload);
                        }
                        let (chunk, _usage) = parse_response(&payload);
                        if !chunk.content.is_empty() {
                            yield Ok(StreamEvent::Delta {
                                content: chunk.content,
                            });
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        yield Ok(StreamEvent::Done { usage });
                        break;
                    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_maps_roles_and_system() {
        let request = ChatRequest {
            model: "google/gemini-2.5-pro".to_string(),
            messages: vec![
                ChatMessage::system("answer in french"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("bonjour"),
            ],
            max_tokens: Some(100),
            temperature: Some(0.5),
            stream: false,
        };
        let body = build_body(&request);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "answer in french"
        );
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn test_parse_response_text_and_function_call() {
        let payload = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "looking it up"},
                        {"functionCall": {"name": "get_weather", "args": {"city": "Lisbon"}}},
                    ],
                },
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 9},
        });
        let (message, usage) = parse_response(&payload);
        assert_eq!(message.content, "looking it up");
        assert_eq!(message.tool_calls[0].name, "get_weather");
        assert_eq!(usage, Usage::new(5, 9));
    }

    #[test]
    fn test_parse_response_empty_payload() {
        let (message, usage) = parse_response(&serde_json::json!({}));
        assert_eq!(message.content, "");
        assert_eq!(usage, Usage::default());
    }
}
