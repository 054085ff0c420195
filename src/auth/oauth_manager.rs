//! OAuth credential bag: key-bag selection semantics plus proactive token
//! refresh with single-flight dedup.
//!
//! Refresh discipline: a credential within the expiry skew is refreshed
//! before it is handed to an operation. Racing callers collapse onto a
//! per-credential-id async mutex; the winner refreshes, the rest re-check
//! freshness under the guard and reuse the winner's tokens. At most one
//! refresh is in flight per credential at any instant.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::auth::health::HealthRecord;
use crate::auth::{fingerprint, MAX_ATTEMPTS};
use crate::context::RequestContext;
use crate::error::{AuthError, ProviderError, ProviderErrorKind};
use crate::types::{ChatMessage, Usage};

/// Refresh this far before nominal expiry.
const REFRESH_SKEW_SECS: i64 = 300;

/// One OAuth credential set. Identity is `id`; two sets are equal iff
/// their ids are equal.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OAuthCredentialSet {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<DateTime<Utc>>,
}

impl PartialEq for OAuthCredentialSet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OAuthCredentialSet {}

impl OAuthCredentialSet {
    /// Whether the access token is inside the refresh skew at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        self.expires_at - now <= skew
    }
}

/// Tokens returned by a successful refresh. `refresh_token` is `None`
/// when the provider did not rotate it.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Boxed future returned by a [`RefreshFn`].
pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<RefreshedToken, ProviderError>> + Send>>;

/// Caller-supplied token refresh call.
pub type RefreshFn = Arc<dyn Fn(RequestContext, OAuthCredentialSet) -> RefreshFuture + Send + Sync>;

/// Fire-and-forget persistence callback invoked after a successful refresh
/// with `(id, access_token, refresh_token, expires_at)`. Errors are logged,
/// never propagated.
pub type OnRefresh = Arc<dyn Fn(&str, &str, &str, DateTime<Utc>) -> anyhow::Result<()> + Send + Sync>;

/// External credential source that can rotate credentials between calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(
        &self,
        provider_name: &str,
    ) -> Result<Vec<OAuthCredentialSet>, ProviderError>;

    async fn update_credential(
        &self,
        provider_name: &str,
        credential: &OAuthCredentialSet,
    ) -> Result<(), ProviderError>;
}

struct OAuthBagState {
    credentials: Vec<OAuthCredentialSet>,
    /// Keyed by credential id; survives credential-provider reloads for
    /// ids that stay, is dropped for ids that retire.
    health: HashMap<String, HealthRecord>,
    cursor: usize,
}

enum LastFailure {
    Operation(ProviderError),
    Refresh { id: String, error: ProviderError },
}

/// OAuth credential bag with health tracking and single-flight refresh.
pub struct OAuthBag {
    provider_name: String,
    refresh_fn: RefreshFn,
    on_refresh: Option<OnRefresh>,
    skew: ChronoDuration,
    penalize_cancellation: bool,
    state: Mutex<OAuthBagState>,
    /// Per-credential-id single-flight holders. The map lock is only held
    /// to fetch or insert a holder; the holder itself is held across the
    /// refresh call.
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    credential_provider: RwLock<Option<Arc<dyn CredentialProvider>>>,
}

impl OAuthBag {
    pub fn new(
        provider_name: impl Into<String>,
        credentials: Vec<OAuthCredentialSet>,
        refresh_fn: RefreshFn,
    ) -> Self {
        let health = credentials
            .iter()
            .map(|cred| (cred.id.clone(), HealthRecord::new()))
            .collect();
        Self {
            provider_name: provider_name.into(),
            refresh_fn,
            on_refresh: None,
            skew: ChronoDuration::seconds(REFRESH_SKEW_SECS),
            penalize_cancellation: true,
            state: Mutex::new(OAuthBagState {
                credentials,
                health,
                cursor: 0,
            }),
            refresh_locks: Mutex::new(HashMap::new()),
            credential_provider: RwLock::new(None),
        }
    }

    /// Install the persistence callback invoked after successful refreshes.
    pub fn with_on_refresh(mut self, on_refresh: OnRefresh) -> Self {
        self.on_refresh = Some(on_refresh);
        self
    }

    /// Same policy knob as the key bag: whether cancellations count as
    /// credential failures. Defaults to true.
    pub fn with_cancellation_penalty(mut self, penalize: bool) -> Self {
        self.penalize_cancellation = penalize;
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Install an external credential source. From now on `execute`
    /// re-reads the credential list before each call.
    pub async fn set_credential_provider(&self, provider: Arc<dyn CredentialProvider>) {
        *self.credential_provider.write().await = Some(provider);
    }

    /// Current credential list (after consulting the credential provider,
    /// when one is configured).
    pub async fn get_credentials(&self) -> Vec<OAuthCredentialSet> {
        self.sync_from_provider().await;
        self.state.lock().await.credentials.clone()
    }

    /// Count of credentials currently selectable.
    pub async fn available_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .credentials
            .iter()
            .filter(|cred| {
                state
                    .health
                    .get(&cred.id)
                    .map_or(true, |record| record.is_available(now))
            })
            .count()
    }

    /// Select and freshen a credential without running an operation.
    ///
    /// Used by callers that drive streaming IO themselves after the
    /// dispatcher's short-circuit: they still need a fresh token, but the
    /// stream cannot be routed through `execute`.
    pub async fn fresh_credential(
        &self,
        ctx: &RequestContext,
    ) -> Result<OAuthCredentialSet, AuthError> {
        self.sync_from_provider().await;
        let id = self.select().await?;
        if let Err(error) = self.ensure_fresh(ctx, &id).await {
            return Err(AuthError::RefreshFailed {
                credential_id: id,
                source: error,
            });
        }
        self.credential_snapshot(&id)
            .await
            .ok_or(AuthError::NoCredentialsConfigured)
    }

    /// Run `operation` under the first credential that succeeds, refreshing
    /// stale tokens along the way. Same attempt cap and health protocol as
    /// the key bag, plus refresh failures counted against the credential.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &RequestContext,
        operation: F,
    ) -> Result<(String, Usage), AuthError>
    where
        F: Fn(RequestContext, OAuthCredentialSet) -> Fut,
        Fut: Future<Output = Result<(String, Usage), ProviderError>>,
    {
        self.execute_with(ctx, operation).await
    }

    /// Message-valued variant of [`Self::execute`], so tool-calling
    /// responses keep their structured records.
    pub async fn execute_message<F, Fut>(
        &self,
        ctx: &RequestContext,
        operation: F,
    ) -> Result<(ChatMessage, Usage), AuthError>
    where
        F: Fn(RequestContext, OAuthCredentialSet) -> Fut,
        Fut: Future<Output = Result<(ChatMessage, Usage), ProviderError>>,
    {
        self.execute_with(ctx, operation).await
    }

    pub(crate) async fn execute_with<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        operation: F,
    ) -> Result<(T, Usage), AuthError>
    where
        F: Fn(RequestContext, OAuthCredentialSet) -> Fut,
        Fut: Future<Output = Result<(T, Usage), ProviderError>>,
    {
        self.sync_from_provider().await;

        let total = self.state.lock().await.credentials.len();
        if total == 0 {
            return Err(AuthError::NoCredentialsConfigured);
        }

        let max_attempts = total.min(MAX_ATTEMPTS);
        let mut attempts = 0;
        let mut last_failure: Option<LastFailure> = None;

        while attempts < max_attempts {
            if attempts > 0 && ctx.is_cancelled() {
                break;
            }

            let id = match self.select().await {
                Ok(id) => id,
                Err(select_error) => {
                    return Err(Self::final_error(last_failure, attempts, select_error));
                }
            };

            attempts += 1;

            if let Err(error) = self.ensure_fresh(ctx, &id).await {
                last_failure = Some(LastFailure::Refresh { id, error });
                continue;
            }

            // Retired by a concurrent credential reload; try the next slot.
            let Some(credential) = self.credential_snapshot(&id).await else {
                continue;
            };

            match operation(ctx.clone(), credential).await {
                Ok(outcome) => {
                    self.report_success(&id).await;
                    return Ok(outcome);
                }
                Err(error) => {
                    self.report_failure(&id, &error).await;
                    let cancelled = error.kind == ProviderErrorKind::Cancelled;
                    last_failure = Some(LastFailure::Operation(error));
                    if cancelled {
                        break;
                    }
                }
            }
        }

        Err(Self::final_error(
            last_failure,
            attempts,
            AuthError::AllUnavailable { total },
        ))
    }

    fn final_error(
        last_failure: Option<LastFailure>,
        attempts: usize,
        fallback: AuthError,
    ) -> AuthError {
        match last_failure {
            Some(LastFailure::Operation(source)) => {
                AuthError::AllAttemptsFailed { attempts, source }
            }
            Some(LastFailure::Refresh { id, error }) => AuthError::RefreshFailed {
                credential_id: id,
                source: error,
            },
            None => fallback,
        }
    }

    /// Round-robin selection by credential id, skipping backoff. Mirrors
    /// the key bag, including the single-credential fast path.
    async fn select(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        let n = state.credentials.len();
        if n == 0 {
            return Err(AuthError::NoCredentialsConfigured);
        }

        let now = Instant::now();
        if n == 1 {
            let cred = &state.credentials[0];
            let available = state
                .health
                .get(&cred.id)
                .map_or(true, |record| record.is_available(now));
            if available {
                return Ok(cred.id.clone());
            }
            return Err(AuthError::AllUnavailable { total: 1 });
        }

        let start = state.cursor % n;
        for offset in 0..n {
            let index = (start + offset) % n;
            let id = &state.credentials[index].id;
            let available = state
                .health
                .get(id)
                .map_or(true, |record| record.is_available(now));
            if available {
                let id = id.clone();
                state.cursor = index + 1;
                return Ok(id);
            }
        }

        Err(AuthError::AllUnavailable { total: n })
    }

    pub(crate) async fn report_success(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.health.get_mut(id) {
            record.record_success();
        }
    }

    pub(crate) async fn report_failure(&self, id: &str, error: &ProviderError) {
        if error.kind == ProviderErrorKind::Cancelled && !self.penalize_cancellation {
            tracing::debug!(
                credential_id = %id,
                "skipping failure bookkeeping for cancelled request"
            );
            return;
        }

        let mut state = self.state.lock().await;
        if let Some(record) = state.health.get_mut(id) {
            record.record_failure();
            let backoff_secs = record
                .backoff_remaining(Instant::now())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            tracing::warn!(
                credential_id = %id,
                provider = %self.provider_name,
                consecutive_failures = record.consecutive_failures(),
                backoff_secs,
                error = %error,
                "OAuth credential placed in backoff"
            );
        }
    }

    async fn credential_snapshot(&self, id: &str) -> Option<OAuthCredentialSet> {
        let state = self.state.lock().await;
        state.credentials.iter().find(|c| c.id == id).cloned()
    }

    /// Refresh the credential if it is inside the skew window, collapsing
    /// concurrent refreshes for the same id onto one call.
    async fn ensure_fresh(&self, ctx: &RequestContext, id: &str) -> Result<(), ProviderError> {
        let Some(credential) = self.credential_snapshot(id).await else {
            return Ok(());
        };
        if !credential.needs_refresh(Utc::now(), self.skew) {
            return Ok(());
        }

        let holder = {
            let mut locks = self.refresh_locks.lock().await;
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        let _guard = holder.lock().await;

        // Re-check under the guard: a racer may have refreshed already.
        let Some(current) = self.credential_snapshot(id).await else {
            return Ok(());
        };
        if !current.needs_refresh(Utc::now(), self.skew) {
            return Ok(());
        }

        match (self.refresh_fn)(ctx.clone(), current).await {
            Ok(token) => {
                self.apply_refresh(id, token).await;
                Ok(())
            }
            Err(error) => {
                self.report_failure(id, &error).await;
                Err(error)
            }
        }
    }

    /// Write refreshed tokens into the credential in place and notify the
    /// persistence side-channels.
    async fn apply_refresh(&self, id: &str, token: RefreshedToken) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(credential) = state.credentials.iter_mut().find(|c| c.id == id) else {
                return;
            };
            credential.access_token = token.access_token;
            if let Some(refresh_token) = token.refresh_token {
                credential.refresh_token = refresh_token;
            }
            credential.expires_at = token.expires_at;
            credential.refresh_count += 1;
            credential.last_refresh_at = Some(Utc::now());
            credential.clone()
        };

        tracing::info!(
            credential_id = %updated.id,
            provider = %self.provider_name,
            refresh_count = updated.refresh_count,
            token = %fingerprint(&updated.access_token),
            "refreshed OAuth access token"
        );

        if let Some(on_refresh) = &self.on_refresh {
            if let Err(error) = on_refresh(
                &updated.id,
                &updated.access_token,
                &updated.refresh_token,
                updated.expires_at,
            ) {
                tracing::error!(
                    credential_id = %updated.id,
                    error = %error,
                    "on_refresh callback failed"
                );
            }
        }

        let provider = self.credential_provider.read().await.clone();
        if let Some(provider) = provider {
            if let Err(error) = provider
                .update_credential(&self.provider_name, &updated)
                .await
            {
                tracing::error!(
                    credential_id = %updated.id,
                    error = %error,
                    "failed to persist refreshed credential"
                );
            }
        }
    }

    /// Pull the current credential list from the external provider, when
    /// one is configured. Surviving ids keep their health; new ids start
    /// fresh; retired ids are dropped.
    async fn sync_from_provider(&self) {
        let provider = self.credential_provider.read().await.clone();
        let Some(provider) = provider else {
            return;
        };

        match provider.get_credentials(&self.provider_name).await {
            Ok(credentials) => {
                {
                    let mut locks = self.refresh_locks.lock().await;
                    locks.retain(|id, _| credentials.iter().any(|c| &c.id == id));
                }
                let mut state = self.state.lock().await;
                state
                    .health
                    .retain(|id, _| credentials.iter().any(|c| &c.id == id));
                for cred in &credentials {
                    state.health.entry(cred.id.clone()).or_default();
                }
                state.credentials = credentials;
            }
            Err(error) => {
                tracing::warn!(
                    provider = %self.provider_name,
                    error = %error,
                    "credential provider fetch failed, using cached credentials"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credential(id: &str, expires_in_secs: i64) -> OAuthCredentialSet {
        OAuthCredentialSet {
            id: id.to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            access_token: format!("access-{id}"),
            refresh_token: format!("refresh-{id}"),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            refresh_count: 0,
            last_refresh_at: None,
        }
    }

    fn counting_refresh_fn(counter: Arc<AtomicUsize>) -> RefreshFn {
        Arc::new(move |_ctx, cred| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Give racers time to pile onto the single-flight guard.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(RefreshedToken {
                    access_token: format!("{}-refreshed", cred.access_token),
                    refresh_token: Some(format!("{}-rotated", cred.refresh_token)),
                    expires_at: Utc::now() + ChronoDuration::hours(1),
                })
            }) as RefreshFuture
        })
    }

    fn failing_refresh_fn() -> RefreshFn {
        Arc::new(|_ctx, _cred| {
            Box::pin(async {
                Err(ProviderError::auth_failed(
                    401,
                    "refresh token revoked".to_string(),
                ))
            }) as RefreshFuture
        })
    }

    #[tokio::test]
    async fn test_fresh_credential_skips_refresh() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 3600)],
            counting_refresh_fn(Arc::clone(&counter)),
        );

        let (token, _usage) = bag
            .execute(&RequestContext::new(), |_ctx, cred| async move {
                Ok((cred.access_token, Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(token, "access-c1");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_credential_is_refreshed_before_use() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 30)],
            counting_refresh_fn(Arc::clone(&counter)),
        );

        let (token, _usage) = bag
            .execute(&RequestContext::new(), |_ctx, cred| async move {
                Ok((cred.access_token, Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(token, "access-c1-refreshed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let creds = bag.get_credentials().await;
        assert_eq!(creds[0].refresh_count, 1);
        assert_eq!(creds[0].refresh_token, "refresh-c1-rotated");
        assert!(creds[0].last_refresh_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_single_flight() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = Arc::new(OAuthBag::new(
            "anthropic",
            vec![credential("c1", 30)],
            counting_refresh_fn(Arc::clone(&counter)),
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let bag = Arc::clone(&bag);
            let seen = Arc::clone(&seen);
            handles.push(tokio::spawn(async move {
                let seen = Arc::clone(&seen);
                bag.execute(&RequestContext::new(), move |_ctx, cred| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().await.push(cred.access_token.clone());
                        Ok(("ok".to_string(), Usage::default()))
                    }
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Exactly one refresh; every caller observed the refreshed token.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().all(|t| t == "access-c1-refreshed"));
        assert_eq!(bag.get_credentials().await[0].refresh_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_and_backs_off() {
        let bag = OAuthBag::new("anthropic", vec![credential("c1", 30)], failing_refresh_fn());
        let calls = AtomicUsize::new(0);
        let err = bag
            .execute(&RequestContext::new(), |_ctx, _cred| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(("ok".to_string(), Usage::default())) }
            })
            .await
            .unwrap_err();
        // The operation never ran and the credential is cooling down.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            AuthError::RefreshFailed {
                credential_id,
                source,
            } => {
                assert_eq!(credential_id, "c1");
                assert_eq!(source.kind, ProviderErrorKind::AuthFailed);
            }
            other => panic!("expected RefreshFailed, got {other}"),
        }
        assert_eq!(bag.available_count().await, 0);
    }

    #[tokio::test]
    async fn test_failover_to_second_credential() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 3600), credential("c2", 3600)],
            counting_refresh_fn(counter),
        );

        let calls = AtomicUsize::new(0);
        let (token, _usage) = bag
            .execute(&RequestContext::new(), |_ctx, cred| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ProviderError::server_error(529, "overloaded".to_string()))
                    } else {
                        Ok((cred.access_token, Usage::default()))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(token, "access-c2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_refresh_callback_receives_new_tokens() {
        let counter = Arc::new(AtomicUsize::new(0));
        let captured: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured_cb = Arc::clone(&captured);
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 30)],
            counting_refresh_fn(counter),
        )
        .with_on_refresh(Arc::new(move |id, access, refresh, _expires_at| {
            captured_cb
                .try_lock()
                .expect("callback runs without contention")
                .push((id.to_string(), access.to_string(), refresh.to_string()));
            Ok(())
        }));

        bag.execute(&RequestContext::new(), |_ctx, _cred| async {
            Ok(("ok".to_string(), Usage::default()))
        })
        .await
        .unwrap();

        let captured = captured.lock().await;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "c1");
        assert_eq!(captured[0].1, "access-c1-refreshed");
        assert_eq!(captured[0].2, "refresh-c1-rotated");
    }

    #[tokio::test]
    async fn test_on_refresh_errors_are_swallowed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 30)],
            counting_refresh_fn(counter),
        )
        .with_on_refresh(Arc::new(|_, _, _, _| anyhow::bail!("disk full")));

        let result = bag
            .execute(&RequestContext::new(), |_ctx, _cred| async {
                Ok(("ok".to_string(), Usage::default()))
            })
            .await;
        assert!(result.is_ok());
    }

    struct RotatingProvider {
        lists: Mutex<Vec<Vec<OAuthCredentialSet>>>,
        updates: Mutex<Vec<OAuthCredentialSet>>,
    }

    #[async_trait]
    impl CredentialProvider for RotatingProvider {
        async fn get_credentials(
            &self,
            _provider_name: &str,
        ) -> Result<Vec<OAuthCredentialSet>, ProviderError> {
            let mut lists = self.lists.lock().await;
            if lists.len() > 1 {
                Ok(lists.remove(0))
            } else {
                Ok(lists[0].clone())
            }
        }

        async fn update_credential(
            &self,
            _provider_name: &str,
            credential: &OAuthCredentialSet,
        ) -> Result<(), ProviderError> {
            self.updates.lock().await.push(credential.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_credential_provider_rotation_gc() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new("anthropic", Vec::new(), counting_refresh_fn(counter));
        let provider = Arc::new(RotatingProvider {
            lists: Mutex::new(vec![
                vec![credential("old", 3600)],
                vec![credential("new", 3600)],
            ]),
            updates: Mutex::new(Vec::new()),
        });
        bag.set_credential_provider(provider).await;

        let (token, _usage) = bag
            .execute(&RequestContext::new(), |_ctx, cred| async move {
                Ok((cred.access_token, Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(token, "access-old");

        // Next call sees the rotated list; the retired id's health is gone.
        let (token, _usage) = bag
            .execute(&RequestContext::new(), |_ctx, cred| async move {
                Ok((cred.access_token, Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(token, "access-new");
        let state = bag.state.lock().await;
        assert!(!state.health.contains_key("old"));
        assert!(state.health.contains_key("new"));
    }

    #[tokio::test]
    async fn test_rotation_drops_orphaned_refresh_locks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new("anthropic", Vec::new(), counting_refresh_fn(counter));
        let provider = Arc::new(RotatingProvider {
            lists: Mutex::new(vec![
                vec![credential("old", 30)],
                vec![credential("new", 3600)],
            ]),
            updates: Mutex::new(Vec::new()),
        });
        bag.set_credential_provider(provider).await;

        // First call refreshes "old", creating its single-flight holder.
        bag.execute(&RequestContext::new(), |_ctx, _cred| async {
            Ok(("ok".to_string(), Usage::default()))
        })
        .await
        .unwrap();
        assert!(bag.refresh_locks.lock().await.contains_key("old"));

        // Rotation retires "old"; its holder goes with its health record.
        bag.execute(&RequestContext::new(), |_ctx, _cred| async {
            Ok(("ok".to_string(), Usage::default()))
        })
        .await
        .unwrap();
        assert!(!bag.refresh_locks.lock().await.contains_key("old"));
        assert!(bag.refresh_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_tokens_are_pushed_to_credential_provider() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new("anthropic", Vec::new(), counting_refresh_fn(counter));
        let provider = Arc::new(RotatingProvider {
            lists: Mutex::new(vec![vec![credential("c1", 30)]]),
            updates: Mutex::new(Vec::new()),
        });
        bag.set_credential_provider(Arc::clone(&provider) as Arc<dyn CredentialProvider>)
            .await;

        bag.execute(&RequestContext::new(), |_ctx, _cred| async {
            Ok(("ok".to_string(), Usage::default()))
        })
        .await
        .unwrap();

        let updates = provider.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].access_token, "access-c1-refreshed");
    }

    #[tokio::test]
    async fn test_empty_bag() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new("anthropic", Vec::new(), counting_refresh_fn(counter));
        let result = bag
            .execute(&RequestContext::new(), |_ctx, _cred| async {
                Ok(("ok".to_string(), Usage::default()))
            })
            .await;
        assert!(matches!(result, Err(AuthError::NoCredentialsConfigured)));
    }

    #[tokio::test]
    async fn test_equality_is_by_id() {
        let a = credential("c1", 10);
        let mut b = credential("c1", 9999);
        b.access_token = "different".to_string();
        assert_eq!(a, b);
        assert_ne!(a, credential("c2", 10));
    }

    #[tokio::test]
    async fn test_fresh_credential_for_streaming() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = OAuthBag::new(
            "anthropic",
            vec![credential("c1", 30)],
            counting_refresh_fn(Arc::clone(&counter)),
        );
        let cred = bag.fresh_credential(&RequestContext::new()).await.unwrap();
        assert_eq!(cred.access_token, "access-c1-refreshed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
