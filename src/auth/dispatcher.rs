//! Per-request authentication orchestration.
//!
//! The dispatcher composes the OAuth bag and the key bag for one logical
//! call: a context-injected token wins outright, OAuth credentials are
//! preferred over API keys, and a failed OAuth pass falls through to the
//! key bag. It holds no state of its own, only bag references.
//!
//! Streaming requests short-circuit: the provider adapter owns the
//! streaming IO, so the dispatcher only verifies that a credential exists
//! and returns a sentinel value. Driving the stream through the dispatcher
//! would issue a second request. Callers must never treat the sentinel
//! triple as a real payload.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::auth::key_manager::KeyBag;
use crate::auth::oauth_manager::{OAuthBag, OAuthCredentialSet};
use crate::context::{AuthKind, RequestContext};
use crate::error::{AuthError, ProviderError};
use crate::providers::ProviderKind;
use crate::types::{ChatMessage, RequestOptions, Usage};

/// Sentinel results for the streaming short-circuit.
pub const STREAMING_WITH_OAUTH: &str = "streaming_with_oauth";
pub const STREAMING_WITH_API_KEY: &str = "streaming_with_api_key";
pub const STREAMING_WITH_CONTEXT_OAUTH: &str = "streaming_with_context_oauth";

/// Credential id used for the one-shot credential built from a
/// context-injected token.
const CONTEXT_CREDENTIAL_ID: &str = "context";

/// Composes the OAuth and API-key bags for one provider.
pub struct AuthDispatcher {
    provider: ProviderKind,
    oauth_bag: Option<Arc<OAuthBag>>,
    key_bag: Option<Arc<KeyBag>>,
}

/// Serializable snapshot of one bag's credential counts.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CredentialCounts {
    pub configured: usize,
    pub available: usize,
}

/// Serializable authentication status for one provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthStatus {
    pub provider: String,
    pub method: &'static str,
    pub oauth: CredentialCounts,
    pub api_keys: CredentialCounts,
}

impl AuthDispatcher {
    pub fn new(
        provider: ProviderKind,
        oauth_bag: Option<Arc<OAuthBag>>,
        key_bag: Option<Arc<KeyBag>>,
    ) -> Self {
        Self {
            provider,
            oauth_bag,
            key_bag,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn oauth_bag(&self) -> Option<&Arc<OAuthBag>> {
        self.oauth_bag.as_ref()
    }

    pub fn key_bag(&self) -> Option<&Arc<KeyBag>> {
        self.key_bag.as_ref()
    }

    /// Execute a string-valued operation under the winning credential.
    pub async fn execute<Fo, FutO, Fk, FutK>(
        &self,
        ctx: &RequestContext,
        options: &RequestOptions,
        oauth_op: Fo,
        api_key_op: Fk,
    ) -> Result<(String, Usage), AuthError>
    where
        Fo: Fn(RequestContext, OAuthCredentialSet) -> FutO,
        FutO: Future<Output = Result<(String, Usage), ProviderError>>,
        Fk: Fn(RequestContext, String) -> FutK,
        FutK: Future<Output = Result<(String, Usage), ProviderError>>,
    {
        self.dispatch(ctx, options, oauth_op, api_key_op, |s| s.to_string())
            .await
    }

    /// Message-valued variant of [`Self::execute`], used for tool-calling
    /// responses whose structured records must survive.
    pub async fn execute_message<Fo, FutO, Fk, FutK>(
        &self,
        ctx: &RequestContext,
        options: &RequestOptions,
        oauth_op: Fo,
        api_key_op: Fk,
    ) -> Result<(ChatMessage, Usage), AuthError>
    where
        Fo: Fn(RequestContext, OAuthCredentialSet) -> FutO,
        FutO: Future<Output = Result<(ChatMessage, Usage), ProviderError>>,
        Fk: Fn(RequestContext, String) -> FutK,
        FutK: Future<Output = Result<(ChatMessage, Usage), ProviderError>>,
    {
        self.dispatch(ctx, options, oauth_op, api_key_op, |s| {
            ChatMessage::assistant(s)
        })
        .await
    }

    async fn dispatch<T, Fo, FutO, Fk, FutK>(
        &self,
        ctx: &RequestContext,
        options: &RequestOptions,
        oauth_op: Fo,
        api_key_op: Fk,
        sentinel: impl Fn(&'static str) -> T,
    ) -> Result<(T, Usage), AuthError>
    where
        Fo: Fn(RequestContext, OAuthCredentialSet) -> FutO,
        FutO: Future<Output = Result<(T, Usage), ProviderError>>,
        Fk: Fn(RequestContext, String) -> FutK,
        FutK: Future<Output = Result<(T, Usage), ProviderError>>,
    {
        // An injected token bypasses both bags entirely.
        if let Some(token) = ctx.auth_token() {
            if options.stream {
                return Ok((sentinel(STREAMING_WITH_CONTEXT_OAUTH), Usage::default()));
            }
            let credential = Self::context_credential(token);
            return match oauth_op(ctx.clone(), credential).await {
                Ok(outcome) => Ok(outcome),
                Err(source) => Err(AuthError::AllAttemptsFailed {
                    attempts: 1,
                    source,
                }),
            };
        }

        if options.stream {
            // Verify a credential exists by inspecting the list length;
            // invoking a closure here would issue a duplicate request.
            if let Some(oauth) = &self.oauth_bag {
                if !oauth.get_credentials().await.is_empty() {
                    return Ok((sentinel(STREAMING_WITH_OAUTH), Usage::default()));
                }
            }
            if let Some(keys) = &self.key_bag {
                if !keys.is_empty() {
                    return Ok((sentinel(STREAMING_WITH_API_KEY), Usage::default()));
                }
            }
            return Err(if self.oauth_bag.is_none() && self.key_bag.is_none() {
                AuthError::NoAuthConfigured
            } else {
                AuthError::NoCredentialsConfigured
            });
        }

        let mut oauth_error = None;
        if let Some(oauth) = &self.oauth_bag {
            match oauth.execute_with(ctx, &oauth_op).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    tracing::warn!(
                        provider = %self.provider.id(),
                        error = %error,
                        "OAuth authentication failed, falling back to API keys"
                    );
                    oauth_error = Some(error);
                }
            }
        }

        if let Some(keys) = &self.key_bag {
            return keys.execute(ctx, &api_key_op).await;
        }

        match oauth_error {
            Some(error) => Err(error),
            None => Err(AuthError::NoAuthConfigured),
        }
    }

    /// One-shot credential wrapping a context-injected access token.
    fn context_credential(token: &str) -> OAuthCredentialSet {
        OAuthCredentialSet {
            id: CONTEXT_CREDENTIAL_ID.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: token.to_string(),
            refresh_token: String::new(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
            refresh_count: 0,
            last_refresh_at: None,
        }
    }

    /// Stamp the token onto an outbound request. OAuth always uses Bearer;
    /// API keys use the provider's header convention.
    pub fn set_auth_headers(
        &self,
        request: reqwest::RequestBuilder,
        token: &str,
        kind: AuthKind,
    ) -> reqwest::RequestBuilder {
        crate::providers::apply_auth(self.provider, request, token, kind)
    }

    /// Stamp provider-static headers (API version pins and the like).
    pub fn set_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.provider {
            ProviderKind::Anthropic => request.header("anthropic-version", "2023-06-01"),
            ProviderKind::OpenAI | ProviderKind::Google => request,
        }
    }

    /// Whether any credential is configured.
    pub async fn is_authenticated(&self) -> bool {
        if let Some(oauth) = &self.oauth_bag {
            if !oauth.get_credentials().await.is_empty() {
                return true;
            }
        }
        self.key_bag.as_ref().is_some_and(|keys| !keys.is_empty())
    }

    /// Preferred authentication method, mirroring the resolution order.
    pub async fn auth_method(&self) -> &'static str {
        if let Some(oauth) = &self.oauth_bag {
            if !oauth.get_credentials().await.is_empty() {
                return "oauth";
            }
        }
        if self.key_bag.as_ref().is_some_and(|keys| !keys.is_empty()) {
            return "api_key";
        }
        "none"
    }

    /// Serializable status snapshot for the HTTP surface.
    pub async fn status(&self) -> AuthStatus {
        let oauth = match &self.oauth_bag {
            Some(bag) => CredentialCounts {
                configured: bag.get_credentials().await.len(),
                available: bag.available_count().await,
            },
            None => CredentialCounts {
                configured: 0,
                available: 0,
            },
        };
        let api_keys = match &self.key_bag {
            Some(bag) => CredentialCounts {
                configured: bag.len(),
                available: bag.available_count().await,
            },
            None => CredentialCounts {
                configured: 0,
                available: 0,
            },
        };
        AuthStatus {
            provider: self.provider.id().to_string(),
            method: self.auth_method().await,
            oauth,
            api_keys,
        }
    }
}
