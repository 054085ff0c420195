//! Broker assembly: one `ProviderBroker` per provider kind, routed by the
//! model's `provider/` prefix.
//!
//! The broker is where the closure plumbing lives: for each request it
//! builds an OAuth operation and an API-key operation over the provider
//! adapter and hands both to the dispatcher. Streaming takes the
//! caller-drives-the-stream path: the dispatcher only confirms a
//! credential exists, then the broker re-reads the credential set and
//! drives the adapter stream itself, reporting the outcome back to the
//! owning bag when the stream finishes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;

use crate::auth::{
    AuthDispatcher, AuthStatus, KeyBag, OAuthBag, STREAMING_WITH_API_KEY,
    STREAMING_WITH_CONTEXT_OAUTH, STREAMING_WITH_OAUTH,
};
use crate::config::{Config, ConfigError};
use crate::connectivity::{ConnectivityCache, ConnectivityConfig};
use crate::context::{AuthKind, RequestContext};
use crate::error::{AuthError, ProviderError};
use crate::providers::{
    oauth_refresh_fn, AnthropicAdapter, ChatStream, GoogleAdapter, OpenAIAdapter,
    ProviderAdapter, ProviderKind,
};
use crate::types::{ChatRequest, ChatResponse, RequestOptions};

/// Error surfaced by the relay's routing layer.
#[derive(Debug)]
pub enum RelayError {
    /// Model name carried a provider prefix we ship no adapter for.
    UnknownProvider(String),
    /// Credential-engine failure.
    Auth(AuthError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::UnknownProvider(id) => write!(f, "unknown provider: {}", id),
            RelayError::Auth(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Auth(error) => Some(error),
            RelayError::UnknownProvider(_) => None,
        }
    }
}

impl From<AuthError> for RelayError {
    fn from(error: AuthError) -> Self {
        RelayError::Auth(error)
    }
}

/// Adapter + dispatcher for one provider.
pub struct ProviderBroker {
    kind: ProviderKind,
    adapter: Arc<dyn ProviderAdapter>,
    dispatcher: AuthDispatcher,
}

impl std::fmt::Debug for ProviderBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBroker")
            .field("kind", &self.kind)
            .finish()
    }
}

enum StreamCredential {
    ApiKey(Arc<KeyBag>, String),
    OAuth(Arc<OAuthBag>, String),
}

impl ProviderBroker {
    pub fn new(
        kind: ProviderKind,
        adapter: Arc<dyn ProviderAdapter>,
        dispatcher: AuthDispatcher,
    ) -> Self {
        Self {
            kind,
            adapter,
            dispatcher,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn dispatcher(&self) -> &AuthDispatcher {
        &self.dispatcher
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    /// Unary chat completion through the credential engine.
    pub async fn chat(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AuthError> {
        let (_provider, model) = request.split_model();
        let model = model.to_string();
        let options = RequestOptions {
            stream: false,
            model: model.clone(),
        };

        let oauth_op = {
            let adapter = Arc::clone(&self.adapter);
            let request = request.clone();
            let model = model.clone();
            move |ctx: RequestContext, cred: crate::auth::OAuthCredentialSet| {
                let adapter = Arc::clone(&adapter);
                let request = request.clone();
                let model = model.clone();
                async move {
                    let auth = ctx.auth_kind().unwrap_or(AuthKind::OAuth);
                    adapter
                        .complete(&ctx, &request, &model, &cred.access_token, auth)
                        .await
                }
            }
        };
        let api_key_op = {
            let adapter = Arc::clone(&self.adapter);
            let request = request.clone();
            let model = model.clone();
            move |ctx: RequestContext, key: String| {
                let adapter = Arc::clone(&adapter);
                let request = request.clone();
                let model = model.clone();
                async move {
                    adapter
                        .complete(&ctx, &request, &model, &key, AuthKind::ApiKey)
                        .await
                }
            }
        };

        let (message, usage) = self
            .dispatcher
            .execute_message(ctx, &options, oauth_op, api_key_op)
            .await?;
        Ok(ChatResponse {
            message,
            usage,
            model: request.model.clone(),
            provider: self.kind.id().to_string(),
        })
    }

    /// Streaming chat completion. The dispatcher's sentinel decides which
    /// credential source backs the stream.
    pub async fn chat_stream(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatStream, AuthError> {
        let (_provider, model) = request.split_model();
        let model = model.to_string();
        let options = RequestOptions {
            stream: true,
            model: model.clone(),
        };

        // Never invoked on the streaming path; present to satisfy the
        // dispatch contract.
        let (sentinel, _usage) = self
            .dispatcher
            .execute(
                ctx,
                &options,
                |_ctx, _cred| async { Ok((String::new(), crate::types::Usage::default())) },
                |_ctx, _key| async { Ok((String::new(), crate::types::Usage::default())) },
            )
            .await?;

        match sentinel.as_str() {
            STREAMING_WITH_CONTEXT_OAUTH => {
                let token = ctx
                    .auth_token()
                    .ok_or(AuthError::NoAuthConfigured)?
                    .to_string();
                let auth = ctx.auth_kind().unwrap_or(AuthKind::OAuth);
                self.adapter
                    .stream(ctx, request, &model, &token, auth)
                    .await
                    .map_err(|source| AuthError::AllAttemptsFailed {
                        attempts: 1,
                        source,
                    })
            }
            STREAMING_WITH_OAUTH => {
                let Some(bag) = self.dispatcher.oauth_bag() else {
                    return Err(AuthError::NoAuthConfigured);
                };
                let credential = bag.fresh_credential(ctx).await?;
                match self
                    .adapter
                    .stream(ctx, request, &model, &credential.access_token, AuthKind::OAuth)
                    .await
                {
                    Ok(stream) => Ok(Self::monitored(
                        stream,
                        StreamCredential::OAuth(Arc::clone(bag), credential.id),
                    )),
                    Err(source) => {
                        bag.report_failure(&credential.id, &source).await;
                        Err(AuthError::AllAttemptsFailed {
                            attempts: 1,
                            source,
                        })
                    }
                }
            }
            STREAMING_WITH_API_KEY => {
                let Some(bag) = self.dispatcher.key_bag() else {
                    return Err(AuthError::NoAuthConfigured);
                };
                let key = bag.select().await?;
                match self
                    .adapter
                    .stream(ctx, request, &model, &key, AuthKind::ApiKey)
                    .await
                {
                    Ok(stream) => Ok(Self::monitored(
                        stream,
                        StreamCredential::ApiKey(Arc::clone(bag), key),
                    )),
                    Err(source) => {
                        bag.report_failure(&key, &source).await;
                        Err(AuthError::AllAttemptsFailed {
                            attempts: 1,
                            source,
                        })
                    }
                }
            }
            other => {
                tracing::error!(sentinel = %other, "unexpected streaming sentinel");
                Err(AuthError::NoAuthConfigured)
            }
        }
    }

    /// Wrap a stream so its final outcome feeds credential health: any
    /// error item counts as a failure, a clean end as a success.
    fn monitored(inner: ChatStream, credential: StreamCredential) -> ChatStream {
        Box::pin(async_stream::stream! {
            let mut inner = inner;
            let mut failed = false;
            while let Some(item) = inner.next().await {
                if let Err(error) = &item {
                    failed = true;
                    match &credential {
                        StreamCredential::ApiKey(bag, key) => {
                            bag.report_failure(key, error).await;
                        }
                        StreamCredential::OAuth(bag, id) => {
                            bag.report_failure(id, error).await;
                        }
                    }
                }
                yield item;
            }
            if !failed {
                match &credential {
                    StreamCredential::ApiKey(bag, key) => bag.report_success(key).await,
                    StreamCredential::OAuth(bag, id) => bag.report_success(id).await,
                }
            }
        })
    }
}

/// The full relay: per-provider brokers plus the shared reachability cache.
pub struct Relay {
    brokers: HashMap<ProviderKind, ProviderBroker>,
    connectivity: Arc<ConnectivityCache>,
    default_provider: ProviderKind,
}

impl Relay {
    /// Build brokers for every shipped provider from configuration. Bags
    /// are created eagerly here; providers without credentials still get a
    /// broker so their status is reportable.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let mut brokers = HashMap::new();
        for kind in ProviderKind::ALL {
            let base_url = config.base_urls.get(&kind).cloned();
            let adapter: Arc<dyn ProviderAdapter> = match kind {
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicAdapter::new(client.clone(), base_url))
                }
                ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(client.clone(), base_url)),
                ProviderKind::Google => Arc::new(GoogleAdapter::new(client.clone(), base_url)),
            };

            let key_bag = config
                .api_keys
                .get(&kind)
                .filter(|keys| !keys.is_empty())
                .map(|keys| Arc::new(KeyBag::new(keys.clone())));
            let oauth_bag = config
                .oauth_credentials
                .get(&kind)
                .filter(|sets| !sets.is_empty())
                .map(|sets| {
                    Arc::new(OAuthBag::new(
                        kind.id(),
                        sets.clone(),
                        oauth_refresh_fn(kind, client.clone()),
                    ))
                });

            if key_bag.is_none() && oauth_bag.is_none() {
                tracing::debug!(provider = %kind, "no credentials configured");
            }

            let dispatcher = AuthDispatcher::new(kind, oauth_bag, key_bag);
            brokers.insert(kind, ProviderBroker::new(kind, adapter, dispatcher));
        }

        Ok(Self {
            brokers,
            connectivity: Arc::new(ConnectivityCache::new(ConnectivityConfig {
                enabled: true,
                ttl: config.connectivity_ttl,
            })),
            default_provider: config.default_provider,
        })
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityCache> {
        &self.connectivity
    }

    pub fn default_provider(&self) -> ProviderKind {
        self.default_provider
    }

    /// Resolve the broker for a request by its model's provider prefix.
    pub fn resolve(&self, request: &ChatRequest) -> Result<&ProviderBroker, RelayError> {
        let (prefix, _model) = request.split_model();
        let kind = match prefix {
            Some(id) => ProviderKind::from_id(id)
                .ok_or_else(|| RelayError::UnknownProvider(id.to_string()))?,
            None => self.default_provider,
        };
        self.brokers
            .get(&kind)
            .ok_or_else(|| RelayError::UnknownProvider(kind.id().to_string()))
    }

    pub async fn chat(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse, RelayError> {
        let broker = self.resolve(request)?;
        Ok(broker.chat(ctx, request).await?)
    }

    pub async fn chat_stream(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatStream, RelayError> {
        let broker = self.resolve(request)?;
        Ok(broker.chat_stream(ctx, request).await?)
    }

    /// Reachability probe through the shared cache.
    pub async fn probe(
        &self,
        ctx: &RequestContext,
        kind: ProviderKind,
        bypass: bool,
    ) -> Result<(), ProviderError> {
        let Some(broker) = self.brokers.get(&kind) else {
            return Err(ProviderError::invalid_request(
                404,
                format!("unknown provider: {}", kind),
            ));
        };
        let adapter = Arc::clone(&broker.adapter);
        self.connectivity
            .probe(
                ctx,
                kind.id(),
                move |ctx| async move { adapter.check_reachable(&ctx).await },
                bypass,
            )
            .await
    }

    /// Auth status snapshots for every provider, in a stable order.
    pub async fn statuses(&self) -> Vec<AuthStatus> {
        let mut statuses = Vec::new();
        for kind in ProviderKind::ALL {
            if let Some(broker) = self.brokers.get(&kind) {
                statuses.push(broker.dispatcher.status().await);
            }
        }
        statuses
    }
}
