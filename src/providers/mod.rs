//! Provider adapters: translate the neutral chat types into each remote
//! service's wire format.
//!
//! Adapters own all provider-specific knowledge: URLs, header names,
//! body shapes, SSE framing, token refresh endpoints. The credential
//! engine never sees any of it.

mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::auth::{RefreshFn, RefreshFuture, RefreshedToken};
use crate::context::{AuthKind, RequestContext};
use crate::error::ProviderError;
use crate::types::{ChatMessage, ChatRequest, StreamEvent, Usage};

/// Header convention a provider uses for API-key authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenHeader {
    Bearer,
    XApiKey,
    XGoogApiKey,
}

/// The remote service families this broker ships adapters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Google,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAI,
        ProviderKind::Google,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Google => "google",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Anthropic => "Anthropic",
            Self::OpenAI => "OpenAI",
            Self::Google => "Google AI",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAI),
            "google" => Some(Self::Google),
            _ => None,
        }
    }

    /// Environment variable holding the comma-separated API key list.
    pub fn env_keys_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEYS",
            Self::OpenAI => "OPENAI_API_KEYS",
            Self::Google => "GOOGLE_API_KEYS",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAI => "https://api.openai.com",
            Self::Google => "https://generativelanguage.googleapis.com",
        }
    }

    /// OAuth token endpoint used for refresh grants.
    pub fn token_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://console.anthropic.com/v1/oauth/token",
            Self::OpenAI => "https://auth.openai.com/oauth/token",
            Self::Google => "https://oauth2.googleapis.com/token",
        }
    }

    pub fn token_header(&self) -> TokenHeader {
        match self {
            Self::Anthropic => TokenHeader::XApiKey,
            Self::OpenAI => TokenHeader::Bearer,
            Self::Google => TokenHeader::XGoogApiKey,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Boxed provider-neutral response stream.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Wire translation for one provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Unary chat completion under the given token.
    async fn complete(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        model: &str,
        token: &str,
        auth: AuthKind,
    ) -> Result<(ChatMessage, Usage), ProviderError>;

    /// Streaming chat completion; yields neutral deltas.
    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        model: &str,
        token: &str,
        auth: AuthKind,
    ) -> Result<ChatStream, ProviderError>;

    /// Lightweight reachability probe, run behind the connectivity cache.
    async fn check_reachable(&self, ctx: &RequestContext) -> Result<(), ProviderError>;
}

/// Stamp a token onto a request builder per the provider's convention.
pub(crate) fn apply_auth(
    kind: ProviderKind,
    request: reqwest::RequestBuilder,
    token: &str,
    auth: AuthKind,
) -> reqwest::RequestBuilder {
    match auth {
        AuthKind::OAuth | AuthKind::Bearer => request.bearer_auth(token),
        AuthKind::ApiKey => match kind.token_header() {
            TokenHeader::Bearer => request.bearer_auth(token),
            TokenHeader::XApiKey => request.header("x-api-key", token),
            TokenHeader::XGoogApiKey => request.header("x-goog-api-key", token),
        },
        AuthKind::Custom => request.header(reqwest::header::AUTHORIZATION, token),
    }
}

pub(crate) fn map_reqwest_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(error.to_string())
    } else {
        ProviderError::network_error(error.to_string())
    }
}

/// Retry-After in seconds, when the provider sent one.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a non-success response into a classified error, keeping a short
/// body excerpt for diagnostics.
pub(crate) async fn response_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(400).collect();
    let mut error = ProviderError::from_status(status, excerpt);
    if let Some(delay) = retry_after {
        error = error.with_retry_after(delay);
    }
    error
}

/// Send a request, racing it against context cancellation.
pub(crate) async fn send_cancellable(
    ctx: &RequestContext,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(ProviderError::cancelled()),
        result = request.send() => result.map_err(map_reqwest_error),
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Build the refresh call for a provider's OAuth token endpoint
/// (`grant_type=refresh_token`). The authorization-code dance is out of
/// scope; only refresh lives here.
pub fn oauth_refresh_fn(kind: ProviderKind, client: reqwest::Client) -> RefreshFn {
    Arc::new(move |ctx: RequestContext, credential| {
        let client = client.clone();
        Box::pin(async move {
            let body = serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": credential.refresh_token,
                "client_id": credential.client_id,
                "client_secret": credential.client_secret,
            });
            let request = client.post(kind.token_url()).json(&body);
            let response = send_cancellable(&ctx, request).await?;
            if !response.status().is_success() {
                return Err(response_error(response).await);
            }
            let payload: TokenEndpointResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::network_error(e.to_string()))?;
            Ok(RefreshedToken {
                access_token: payload.access_token,
                refresh_token: payload.refresh_token,
                expires_at: Utc::now() + ChronoDuration::seconds(payload.expires_in),
            })
        }) as RefreshFuture
    })
}
