//! API-key bag: round-robin selection with per-key health and failover.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::auth::health::HealthRecord;
use crate::auth::{fingerprint, MAX_ATTEMPTS};
use crate::context::RequestContext;
use crate::error::{AuthError, ProviderError, ProviderErrorKind};
use crate::types::Usage;

struct KeyBagState {
    /// Rotation cursor. Set to just past the selected index so that
    /// consecutive selections differ whenever two keys are available,
    /// even when the rotation skips keys in backoff.
    cursor: usize,
    /// Keyed by the key string itself; duplicate keys share one record.
    health: HashMap<String, HealthRecord>,
}

/// An ordered, immutable bag of API keys with per-key health state.
///
/// The key sequence never changes after construction; only health records
/// and the cursor do. The internal lock is held during selection and
/// health mutation, never across the caller's operation.
pub struct KeyBag {
    keys: Vec<String>,
    state: Mutex<KeyBagState>,
    penalize_cancellation: bool,
}

impl KeyBag {
    pub fn new(keys: Vec<String>) -> Self {
        let health = keys
            .iter()
            .map(|key| (key.clone(), HealthRecord::new()))
            .collect();
        Self {
            keys,
            state: Mutex::new(KeyBagState { cursor: 0, health }),
            penalize_cancellation: true,
        }
    }

    /// Whether a cancellation returned by an operation counts as a
    /// credential failure (backoff applied). Defaults to true: from the
    /// key's point of view a cancelled request is indistinguishable from
    /// a local timeout.
    pub fn with_cancellation_penalty(mut self, penalize: bool) -> Self {
        self.penalize_cancellation = penalize;
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Count of keys currently selectable.
    pub async fn available_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        self.keys
            .iter()
            .filter(|key| {
                state
                    .health
                    .get(key.as_str())
                    .map_or(true, |record| record.is_available(now))
            })
            .count()
    }

    /// Pick the next available key in rotation.
    ///
    /// The caller must later report the outcome via [`Self::report_success`]
    /// or [`Self::report_failure`].
    pub async fn select(&self) -> Result<String, AuthError> {
        if self.keys.is_empty() {
            return Err(AuthError::NoCredentialsConfigured);
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();

        // Single-key fast path: no cursor arithmetic.
        if self.keys.len() == 1 {
            let key = &self.keys[0];
            let available = state
                .health
                .get(key.as_str())
                .map_or(true, |record| record.is_available(now));
            if available {
                return Ok(key.clone());
            }
            return Err(AuthError::AllUnavailable { total: 1 });
        }

        let n = self.keys.len();
        let start = state.cursor % n;
        for offset in 0..n {
            let index = (start + offset) % n;
            let key = &self.keys[index];
            let available = state
                .health
                .get(key.as_str())
                .map_or(true, |record| record.is_available(now));
            if available {
                state.cursor = index + 1;
                return Ok(key.clone());
            }
        }

        Err(AuthError::AllUnavailable { total: n })
    }

    /// Clear failure state for a key. No-op for keys not in this bag.
    pub async fn report_success(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.health.get_mut(key) {
            record.record_success();
        }
    }

    /// Count a failure against a key and back it off. No-op for keys not
    /// in this bag.
    pub async fn report_failure(&self, key: &str, error: &ProviderError) {
        if error.kind == ProviderErrorKind::Cancelled && !self.penalize_cancellation {
            tracing::debug!(
                key = %fingerprint(key),
                "skipping failure bookkeeping for cancelled request"
            );
            return;
        }

        let mut state = self.state.lock().await;
        if let Some(record) = state.health.get_mut(key) {
            record.record_failure();
            let backoff_secs = record
                .backoff_remaining(Instant::now())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            tracing::warn!(
                key = %fingerprint(key),
                consecutive_failures = record.consecutive_failures(),
                backoff_secs,
                error = %error,
                "API key placed in backoff"
            );
        }
    }

    /// Run `operation` under the first key that succeeds.
    ///
    /// Performs at most `min(N, 3)` attempts, reporting each outcome to the
    /// health map. The bag lock is never held while `operation` runs. A
    /// cancellation observed between attempts aborts further retries; a
    /// cancellation returned *by* an attempt is recorded as a failure and
    /// stops the loop.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        operation: F,
    ) -> Result<(T, Usage), AuthError>
    where
        F: Fn(RequestContext, String) -> Fut,
        Fut: Future<Output = Result<(T, Usage), ProviderError>>,
    {
        if self.keys.is_empty() {
            return Err(AuthError::NoCredentialsConfigured);
        }

        let max_attempts = self.keys.len().min(MAX_ATTEMPTS);
        let mut attempts = 0;
        let mut last_error: Option<ProviderError> = None;

        while attempts < max_attempts {
            if attempts > 0 && ctx.is_cancelled() {
                break;
            }

            let key = match self.select().await {
                Ok(key) => key,
                Err(select_error) => {
                    return match last_error {
                        Some(source) => Err(AuthError::AllAttemptsFailed { attempts, source }),
                        None => Err(select_error),
                    };
                }
            };

            attempts += 1;
            match operation(ctx.clone(), key.clone()).await {
                Ok(outcome) => {
                    self.report_success(&key).await;
                    return Ok(outcome);
                }
                Err(error) => {
                    self.report_failure(&key, &error).await;
                    let cancelled = error.kind == ProviderErrorKind::Cancelled;
                    last_error = Some(error);
                    if cancelled {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(source) => Err(AuthError::AllAttemptsFailed { attempts, source }),
            None => Err(AuthError::AllUnavailable {
                total: self.keys.len(),
            }),
        }
    }
}
