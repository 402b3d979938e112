//! Per-host health state machine, transitions, and backoff computation

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// The default healthy-TTL before a reuse must re-probe
pub const DEFAULT_HEALTHY_TTL: Duration = Duration::from_secs(15);
/// The default ceiling on computed backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
/// The floor every computed backoff is clamped above
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Health status for one pool key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No observation has been made yet
    Unknown,
    /// Last observation succeeded and is still within the healthy TTL
    Healthy,
    /// Last observation failed; in or past backoff
    Unhealthy,
    /// A probe is currently in flight
    Probing,
}

/// A signal an operation reports back to the health model after it
/// completes, derived from how the operation's exit code classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// The operation succeeded and the transport is known-good
    Success,
    /// A transport-layer failure occurred; the connection is discarded
    Transport,
    /// The user's command failed; the network is fine
    CommandFailure,
    /// The command exceeded its remote timer, but the transport is fine
    Timeout,
}

/// Mutable per-pool-key health record
///
/// Invariants:
/// - `Healthy` implies `last_success_at` is set and `backoff_until` is
///   unset or in the past.
/// - `Unhealthy` implies `last_failure_at` is set and
///   `backoff_until > last_failure_at`.
/// - `consecutive_failures == 0` iff the last non-probe transition was
///   a success.
#[derive(Debug, Clone)]
pub struct Health {
    status: HealthStatus,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_error: Option<String>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    observed_latency: Option<Duration>,
    healthy_ttl: Duration,
    max_backoff: Duration,
}

impl Health {
    /// A fresh, never-observed health record
    pub fn unknown(healthy_ttl: Duration, max_backoff: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            consecutive_failures: 0,
            backoff_until: None,
            observed_latency: None,
            healthy_ttl,
            max_backoff,
        }
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Timestamp of the last successful observation, if any
    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Timestamp of the last failed observation, if any
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// The most recent short error description, if any
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Consecutive failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The instant backoff lifts, if currently in backoff
    pub fn backoff_until(&self) -> Option<Instant> {
        self.backoff_until
    }

    /// The most recently observed probe/operation latency
    pub fn observed_latency(&self) -> Option<Duration> {
        self.observed_latency
    }

    /// Whether `now` is still inside an active backoff window
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.map_or(false, |until| now < until)
    }

    /// Whether the last success is still fresh enough to reuse without
    /// re-probing
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.status == HealthStatus::Healthy
            && self
                .last_success_at
                .is_some_and(|t| now.duration_since(t) <= self.healthy_ttl)
    }

    /// Mark a probe as started
    pub fn begin_probe(&mut self) {
        self.status = HealthStatus::Probing;
    }

    /// Record a successful observation. Clears failure history and
    /// backoff unconditionally — a single success from `Unhealthy`
    /// recovers the host.
    pub fn record_success(&mut self, now: Instant, latency: Option<Duration>) {
        self.status = HealthStatus::Healthy;
        self.last_success_at = Some(now);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.backoff_until = None;
        if latency.is_some() {
            self.observed_latency = latency;
        }
        debug!("health: recovered to healthy");
    }

    /// Record a transport failure, compute the next backoff window, and
    /// move to `Unhealthy`. A `CommandFailure` signal must never reach
    /// this method — the network worked, so health is unaffected;
    /// only `Transport` (and transport-flavored `Timeout`)
    /// signals call this.
    pub fn record_failure(&mut self, now: Instant, error: impl Into<String>) {
        self.status = HealthStatus::Unhealthy;
        self.last_failure_at = Some(now);
        self.last_error = Some(error.into());
        self.consecutive_failures += 1;
        self.backoff_until = Some(now + self.compute_backoff());
        debug!(
            failures = self.consecutive_failures,
            "health: marked unhealthy"
        );
    }

    /// `base = min(1s * 2^(failures-1), max_backoff)`, jittered by
    /// ±20% and floored at 100ms.
    fn compute_backoff(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(32);
        let base = Duration::from_millis(1000)
            .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        let base_ms = base.as_millis() as i64;
        let jitter_ms = rand::thread_rng().gen_range(-(base_ms * 2 / 10)..=(base_ms * 2 / 10));
        let total_ms = (base_ms + jitter_ms).max(MIN_BACKOFF.as_millis() as i64);
        Duration::from_millis(total_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> Health {
        Health::unknown(DEFAULT_HEALTHY_TTL, DEFAULT_MAX_BACKOFF)
    }

    #[test]
    fn starts_unknown() {
        let h = health();
        assert_eq!(h.status(), HealthStatus::Unknown);
        assert_eq!(h.consecutive_failures(), 0);
    }

    #[test]
    fn success_clears_failure_state() {
        let mut h = health();
        let now = Instant::now();
        h.record_failure(now, "boom");
        assert_eq!(h.consecutive_failures(), 1);
        h.record_success(now + Duration::from_millis(200), None);
        assert_eq!(h.status(), HealthStatus::Healthy);
        assert_eq!(h.consecutive_failures(), 0);
        assert!(h.backoff_until().is_none());
    }

    #[test]
    fn backoff_never_exceeds_max_times_1_2() {
        let mut h = health();
        let mut now = Instant::now();
        for _ in 0..8 {
            h.record_failure(now, "e");
            let until = h.backoff_until().unwrap();
            let computed = until - now;
            assert!(
                computed <= DEFAULT_MAX_BACKOFF.mul_f64(1.2),
                "backoff {computed:?} exceeded ceiling"
            );
            now = until;
        }
    }

    #[test]
    fn backoff_grows_with_consecutive_failures_within_jitter_band() {
        let mut h = health();
        let now = Instant::now();
        h.record_failure(now, "e");
        let first = h.backoff_until().unwrap() - now;
        // first failure: base = 1s, jitter +-20%, floor 100ms
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
    }

    #[test]
    fn is_fresh_false_once_past_healthy_ttl() {
        let mut h = Health::unknown(Duration::from_millis(10), DEFAULT_MAX_BACKOFF);
        let now = Instant::now();
        h.record_success(now, None);
        assert!(h.is_fresh(now));
        assert!(!h.is_fresh(now + Duration::from_millis(50)));
    }

    #[test]
    fn in_backoff_respects_window() {
        let mut h = health();
        let now = Instant::now();
        h.record_failure(now, "e");
        assert!(h.in_backoff(now));
        let until = h.backoff_until().unwrap();
        assert!(!h.in_backoff(until + Duration::from_millis(1)));
    }
}
