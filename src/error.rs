//! Provider and broker error types with retry classification.
//!
//! `ProviderError` is produced at the provider boundary (adapters, refresh
//! calls, reachability probes) and classified there; the credential engine
//! treats every closure-returned error uniformly and never inspects the
//! retry codes itself. `AuthError` is what the engine surfaces at its own
//! boundary, always wrapping the last provider error so callers keep full
//! diagnostic context.

use std::time::Duration;

use thiserror::Error;

/// Error from a provider-facing call.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// The kind of error
    pub kind: ProviderErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Retry delay hinted by the provider (Retry-After). Carried for
    /// callers; the credential backoff curve ignores it.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Create an authentication error (401/403).
    pub fn auth_failed(status_code: u16, message: String) -> Self {
        Self {
            kind: ProviderErrorKind::AuthFailed,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: ProviderErrorKind::ServerError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::NetworkError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::Timeout,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create an invalid-request error (4xx other than 401/403/429).
    pub fn invalid_request(status_code: u16, message: String) -> Self {
        Self {
            kind: ProviderErrorKind::InvalidRequest,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled() -> Self {
        Self {
            kind: ProviderErrorKind::Cancelled,
            status_code: None,
            message: "request cancelled".to_string(),
            retry_after: None,
        }
    }

    /// Build an error from an HTTP status and response excerpt.
    pub fn from_status(status_code: u16, message: String) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Attach a Retry-After hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Check if this error is transient from the provider's point of view.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Authentication/authorization rejected (401/403) - permanent for that credential
    AuthFailed,
    /// Rate limited (429) - transient
    RateLimited,
    /// Server error (5xx) - transient
    ServerError,
    /// Network error (connection failed, DNS, TLS) - transient
    NetworkError,
    /// Request or connection timed out - transient
    Timeout,
    /// Provider rejected the request body (bad prompt, content filter) - permanent
    InvalidRequest,
    /// The request context was cancelled locally
    Cancelled,
}

impl ProviderErrorKind {
    /// Check if this error kind is transient (worth retrying somewhere).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::NetworkError
                | ProviderErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::AuthFailed => write!(f, "Authentication failed"),
            ProviderErrorKind::RateLimited => write!(f, "Rate limited"),
            ProviderErrorKind::ServerError => write!(f, "Server error"),
            ProviderErrorKind::NetworkError => write!(f, "Network error"),
            ProviderErrorKind::Timeout => write!(f, "Timeout"),
            ProviderErrorKind::InvalidRequest => write!(f, "Invalid request"),
            ProviderErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Parse an HTTP status code into an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::AuthFailed,
        429 => ProviderErrorKind::RateLimited,
        408 => ProviderErrorKind::Timeout,
        400..=499 => ProviderErrorKind::InvalidRequest,
        _ => ProviderErrorKind::ServerError,
    }
}

/// Error surfaced at the credential-engine boundary.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Neither an OAuth bag nor a key bag is configured.
    #[error("no authentication configured")]
    NoAuthConfigured,

    /// The consulted bag holds no credentials at all.
    #[error("no credentials configured")]
    NoCredentialsConfigured,

    /// Every configured credential is cooling down; nothing was attempted.
    #[error("{}", all_unavailable_message(.total))]
    AllUnavailable { total: usize },

    /// Every attempt ran and failed; wraps the last provider error.
    #[error("all {attempts} attempts failed, last error: {source}")]
    AllAttemptsFailed {
        attempts: usize,
        #[source]
        source: ProviderError,
    },

    /// The last failed attempt died in token refresh for this credential.
    #[error("token refresh failed for credential {credential_id}: {source}")]
    RefreshFailed {
        credential_id: String,
        #[source]
        source: ProviderError,
    },
}

fn all_unavailable_message(total: &usize) -> String {
    if *total == 1 {
        "the only configured credential is cooling down".to_string()
    } else {
        format!("all {} credentials are cooling down", total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderErrorKind::RateLimited.is_transient());
        assert!(ProviderErrorKind::ServerError.is_transient());
        assert!(ProviderErrorKind::NetworkError.is_transient());
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(!ProviderErrorKind::AuthFailed.is_transient());
        assert!(!ProviderErrorKind::InvalidRequest.is_transient());
        assert!(!ProviderErrorKind::Cancelled.is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(401), ProviderErrorKind::AuthFailed);
        assert_eq!(classify_http_status(403), ProviderErrorKind::AuthFailed);
        assert_eq!(classify_http_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(classify_http_status(400), ProviderErrorKind::InvalidRequest);
        assert_eq!(classify_http_status(422), ProviderErrorKind::InvalidRequest);
        assert_eq!(classify_http_status(500), ProviderErrorKind::ServerError);
        assert_eq!(classify_http_status(503), ProviderErrorKind::ServerError);
    }

    #[test]
    fn test_all_unavailable_messages_are_distinct() {
        let one = AuthError::AllUnavailable { total: 1 }.to_string();
        let many = AuthError::AllUnavailable { total: 4 }.to_string();
        assert!(one.contains("only configured credential"));
        assert!(many.contains("all 4 credentials"));
    }

    #[test]
    fn test_wrapped_error_is_exposed_as_source() {
        use std::error::Error;
        let err = AuthError::AllAttemptsFailed {
            attempts: 3,
            source: ProviderError::server_error(502, "bad gateway".to_string()),
        };
        assert!(err.to_string().contains("all 3 attempts failed"));
        let source = err.source().expect("wrapped provider error");
        assert!(source.to_string().contains("bad gateway"));
    }
}
