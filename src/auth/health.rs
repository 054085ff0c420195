//! Per-credential health state.

use std::time::{Duration, Instant};

/// Consecutive failures after which a credential is flagged unhealthy.
pub(crate) const UNHEALTHY_THRESHOLD: u32 = 3;

/// Backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Health bookkeeping for a single credential.
///
/// Pure value type; the owning bag serializes access. The `healthy` flag
/// is advisory only; availability is decided solely by the backoff
/// deadline, which is what lets an unhealthy credential recover once its
/// backoff elapses.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    healthy: bool,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRecord {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            backoff_until: None,
            last_success_at: Some(Instant::now()),
            last_failure_at: None,
            healthy: true,
        }
    }

    /// Clear all failure state.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
        self.last_success_at = Some(Instant::now());
        self.healthy = true;
    }

    /// Count a failure and push the backoff deadline out.
    ///
    /// The k-th consecutive failure backs off `min(60 s, 2^min(k-1, 6) s)`:
    /// 1, 2, 4, 8, 16, 32, 60, 60, …
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        let exponent = (self.consecutive_failures - 1).min(6);
        let delay = Duration::from_secs(1u64 << exponent).min(MAX_BACKOFF);
        self.backoff_until = Some(now + delay);
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
            self.healthy = false;
        }
    }

    /// Whether the credential may be selected at `now`.
    pub fn is_available(&self, now: Instant) -> bool {
        match self.backoff_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Remaining backoff at `now`, if any.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until.and_then(|until| {
            if now < until {
                Some(until - now)
            } else {
                None
            }
        })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generous slack for test scheduling delays.
    const TOLERANCE: Duration = Duration::from_millis(200);

    fn assert_backoff_close(record: &HealthRecord, expected: Duration) {
        let remaining = record
            .backoff_remaining(Instant::now())
            .expect("backoff should be set");
        assert!(
            remaining <= expected && remaining + TOLERANCE >= expected,
            "backoff {:?} not within tolerance of {:?}",
            remaining,
            expected
        );
    }

    #[test]
    fn test_backoff_curve() {
        // k-th failure backs off min(60, 2^min(k-1, 6)) seconds.
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60, 60, 60];
        let mut record = HealthRecord::new();
        for (i, secs) in expected.iter().enumerate() {
            record.record_failure();
            assert_eq!(record.consecutive_failures(), i as u32 + 1);
            assert_backoff_close(&record, Duration::from_secs(*secs));
        }
    }

    #[test]
    fn test_backoff_capped_at_sixty_seconds() {
        let mut record = HealthRecord::new();
        for _ in 0..100 {
            record.record_failure();
        }
        assert_eq!(record.consecutive_failures(), 100);
        assert_backoff_close(&record, Duration::from_secs(60));
    }

    #[test]
    fn test_success_clears_all_failure_state() {
        let mut record = HealthRecord::new();
        for _ in 0..5 {
            record.record_failure();
        }
        assert!(!record.healthy());

        record.record_success();
        assert_eq!(record.consecutive_failures(), 0);
        assert!(record.healthy());
        assert!(record.is_available(Instant::now()));
        assert!(record.backoff_remaining(Instant::now()).is_none());
    }

    #[test]
    fn test_unhealthy_after_three_failures() {
        let mut record = HealthRecord::new();
        record.record_failure();
        assert!(record.healthy());
        record.record_failure();
        assert!(record.healthy());
        record.record_failure();
        assert!(!record.healthy());
    }

    #[test]
    fn test_unavailable_while_backing_off() {
        let mut record = HealthRecord::new();
        assert!(record.is_available(Instant::now()));
        record.record_failure();
        assert!(!record.is_available(Instant::now()));
        // A deadline in the past is available again.
        assert!(record.is_available(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_success_is_idempotent() {
        let mut record = HealthRecord::new();
        record.record_success();
        let failures = record.consecutive_failures();
        let healthy = record.healthy();
        record.record_success();
        assert_eq!(record.consecutive_failures(), failures);
        assert_eq!(record.healthy(), healthy);
        assert!(record.backoff_remaining(Instant::now()).is_none());
    }

    #[test]
    fn test_failure_then_success_leaves_no_latent_state() {
        let mut record = HealthRecord::new();
        record.record_failure();
        record.record_success();
        assert!(record.healthy());
        assert!(record.is_available(Instant::now()));
        // The next failure starts the curve over at one second.
        record.record_failure();
        assert_backoff_close(&record, Duration::from_secs(1));
    }
}
