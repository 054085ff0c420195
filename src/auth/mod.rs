//! Credential management: per-credential health, key and OAuth bags, and
//! the per-request authentication dispatcher.
//!
//! A bag is an ordered, immutable collection of credentials of one kind.
//! Selection is round-robin over credentials whose backoff has elapsed;
//! failures drive an exponential backoff curve (1-2-4-8-16-32-60 s) and
//! three consecutive failures mark a credential unhealthy. Recovery is
//! implicit: an unhealthy credential whose backoff has elapsed is
//! selectable again.

mod dispatcher;
mod health;
mod key_manager;
mod oauth_manager;

pub use dispatcher::{
    AuthDispatcher, AuthStatus, CredentialCounts, STREAMING_WITH_API_KEY,
    STREAMING_WITH_CONTEXT_OAUTH, STREAMING_WITH_OAUTH,
};
pub use health::HealthRecord;
pub use key_manager::KeyBag;
pub use oauth_manager::{
    CredentialProvider, OAuthBag, OAuthCredentialSet, OnRefresh, RefreshFn, RefreshFuture,
    RefreshedToken,
};

use sha2::{Digest, Sha256};

/// Maximum attempts one `execute` call makes, regardless of bag size.
/// Unbounded iteration is pointless against systemic failures and
/// amplifies load; three rides out a single bad credential.
pub(crate) const MAX_ATTEMPTS: usize = 3;

/// Short stable fingerprint of a secret, safe for log output.
///
/// Hashes a fixed namespace plus the secret so similar secrets from other
/// input domains cannot collide.
pub(crate) fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"llm-relay:credential:");
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = fingerprint("sk-test-1");
        let b = fingerprint("sk-test-1");
        let c = fingerprint("sk-test-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("sk-test"));
    }
}
