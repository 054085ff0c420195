//! Per-request context: cooperative cancellation plus auth injection.
//!
//! A `RequestContext` travels through every public broker call. It wraps a
//! `CancellationToken` (clones share the same token, so cancelling the
//! parent cancels every in-flight clone) and can carry an access token
//! injected by an upstream layer, which short-circuits credential
//! selection entirely.

use tokio_util::sync::CancellationToken;

/// How a token should be stamped onto an outbound HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// OAuth access token; always `Authorization: Bearer`.
    OAuth,
    /// Plain bearer token.
    Bearer,
    /// Provider API key; the header name depends on the provider.
    ApiKey,
    /// Caller-provided raw `Authorization` value.
    Custom,
}

/// Cancellation plus optional auth overrides for one logical request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    auth_token: Option<String>,
    auth_kind: Option<AuthKind>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an access token. The dispatcher will use it directly instead
    /// of consulting any credential bag.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Select the header-stamping rule for the injected token.
    pub fn with_auth_kind(mut self, kind: AuthKind) -> Self {
        self.auth_kind = Some(kind);
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn auth_kind(&self) -> Option<AuthKind> {
        self.auth_kind
    }

    /// Request cancellation. Every clone of this context observes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled. Operations racing network
    /// IO against cancellation should `tokio::select!` on this.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RequestContext::new();
        let child = ctx.clone();
        assert!(!child.is_cancelled());
        ctx.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_auth_token_injection() {
        let ctx = RequestContext::new()
            .with_auth_token("tok-1")
            .with_auth_kind(AuthKind::OAuth);
        assert_eq!(ctx.auth_token(), Some("tok-1"));
        assert_eq!(ctx.auth_kind(), Some(AuthKind::OAuth));
    }
}
