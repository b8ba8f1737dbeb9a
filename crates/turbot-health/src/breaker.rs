//! Circuit breaker for upstream API availability
//!
//! Implements the circuit breaker pattern for a single upstream backend so
//! callers can fail fast while the backend is down and probe it again after
//! an exponentially growing backoff.
//!
//! The breaker does no I/O and no logging. Callers decide what to log or
//! announce from the values it returns.

use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

use crate::classify::classify;

/// Consecutive closed-state failures that trip the breaker
pub const FAILURE_THRESHOLD: u32 = 3;

/// Backoff applied on the first trip
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound for the doubled backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation - calls allowed
    Closed,
    /// Backend considered down - reject calls immediately
    Open,
    /// Backoff expired - the next call is a recovery probe
    ///
    /// Never stored; only ever derived from `Open` on read.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Transition worth announcing, as observed by [`HealthBreaker::record_outcome`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// This failure opened the breaker (threshold reached or probe failed)
    Tripped,
    /// A recovery probe succeeded and the breaker closed
    Recovered,
}

/// Tuning for a [`HealthBreaker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Effective state for the stored fields at `now`
///
/// `Open` reads as `HalfOpen` once it has outlived its backoff window. Every
/// other stored state is returned unchanged.
pub fn derive_state(
    stored: BreakerState,
    opened_at: Option<Instant>,
    backoff: Duration,
    now: Instant,
) -> BreakerState {
    match (stored, opened_at) {
        (BreakerState::Open, Some(opened)) if now.saturating_duration_since(opened) >= backoff => {
            BreakerState::HalfOpen
        }
        _ => stored,
    }
}

/// Circuit breaker for one upstream backend
///
/// Own one instance per backend and hold it in the component that makes the
/// calls. Methods take `&mut self`; share it behind a mutex if calls to the
/// same backend run concurrently, since the read-then-write transitions are
/// not atomic.
///
/// # Example
///
/// ```
/// use turbot_health::{BreakerState, HealthBreaker};
///
/// let mut breaker = HealthBreaker::default();
///
/// assert!(!breaker.record_failure());
/// assert!(!breaker.record_failure());
/// assert!(breaker.record_failure());
///
/// assert_eq!(breaker.current_state(), BreakerState::Open);
/// assert!(!breaker.is_available());
/// ```
#[derive(Debug, Clone)]
pub struct HealthBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    backoff: Duration,
    opened_at: Option<Instant>,
}

impl HealthBreaker {
    /// Create a closed breaker with the given tuning
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            backoff: config.initial_backoff,
            opened_at: None,
        }
    }

    /// Current state, evaluated at `now`
    pub fn current_state_at(&self, now: Instant) -> BreakerState {
        derive_state(self.state, self.opened_at, self.backoff, now)
    }

    /// Current state
    pub fn current_state(&self) -> BreakerState {
        self.current_state_at(Instant::now())
    }

    /// Should a call be attempted at `now`?
    pub fn is_available_at(&self, now: Instant) -> bool {
        self.current_state_at(now) != BreakerState::Open
    }

    /// Should a call be attempted right now?
    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    /// Record a successful call: close the breaker and reset backoff
    ///
    /// Callers that want to announce recovery must check for `HalfOpen`
    /// before calling this (or use [`record_outcome`](Self::record_outcome)).
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.backoff = self.config.initial_backoff;
        self.opened_at = None;
    }

    /// Record a transient failure observed at `now`
    ///
    /// Returns `true` if this failure opened the breaker.
    pub fn record_failure_at(&mut self, now: Instant) -> bool {
        match self.current_state_at(now) {
            BreakerState::HalfOpen => {
                // Probe failed - reopen with doubled backoff
                self.backoff = self
                    .backoff
                    .saturating_mul(2)
                    .min(self.config.max_backoff);
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                true
            }
            BreakerState::Open => false,
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a transient failure
    ///
    /// Returns `true` if this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.record_failure_at(Instant::now())
    }

    /// Record the result of a call at `now`, classifying any error
    ///
    /// Permanent errors (auth, malformed request, anything unrecognised)
    /// leave the breaker untouched.
    pub fn record_outcome_at<T, E>(
        &mut self,
        result: &std::result::Result<T, E>,
        now: Instant,
    ) -> Option<BreakerTransition>
    where
        E: Error + 'static,
    {
        match result {
            Ok(_) => {
                let was_recovering = self.current_state_at(now) == BreakerState::HalfOpen;
                self.record_success();
                was_recovering.then_some(BreakerTransition::Recovered)
            }
            Err(e) if classify(e) => self
                .record_failure_at(now)
                .then_some(BreakerTransition::Tripped),
            Err(_) => None,
        }
    }

    /// Record the result of a call, classifying any error
    pub fn record_outcome<T, E>(
        &mut self,
        result: &std::result::Result<T, E>,
    ) -> Option<BreakerTransition>
    where
        E: Error + 'static,
    {
        self.record_outcome_at(result, Instant::now())
    }

    /// Time left before the breaker reads as half-open, zero unless open
    pub fn retry_in_at(&self, now: Instant) -> Duration {
        match (self.current_state_at(now), self.opened_at) {
            (BreakerState::Open, Some(opened)) => self
                .backoff
                .saturating_sub(now.saturating_duration_since(opened)),
            _ => Duration::ZERO,
        }
    }

    /// Human-readable status line for `backend` at `now`
    pub fn status_message_at(&self, backend: &str, now: Instant) -> String {
        match self.current_state_at(now) {
            BreakerState::Closed => format!("{} is healthy.", backend),
            BreakerState::Open => format!(
                "{} is unreachable. Next retry in {}s.",
                backend,
                self.retry_in_at(now).as_secs()
            ),
            BreakerState::HalfOpen => {
                format!("{} is recovering, testing with next request.", backend)
            }
        }
    }

    /// Human-readable status line for `backend`
    pub fn status_message(&self, backend: &str) -> String {
        self.status_message_at(backend, Instant::now())
    }

    /// Consecutive failures counted while closed
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current backoff window
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl Default for HealthBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UpstreamError;

    fn tripped_at(now: Instant) -> HealthBreaker {
        let mut breaker = HealthBreaker::default();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_at(now);
        }
        breaker
    }

    #[test]
    fn test_initial_state_closed() {
        let breaker = HealthBreaker::default();
        assert_eq!(breaker.current_state(), BreakerState::Closed);
        assert!(breaker.is_available());
        assert_eq!(breaker.backoff(), INITIAL_BACKOFF);
    }

    #[test]
    fn test_only_third_failure_trips() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::default();

        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(breaker.record_failure_at(now));
            if results.len() < 3 {
                assert!(breaker.is_available_at(now));
            }
        }

        assert_eq!(results, vec![false, false, true, false, false]);
        assert_eq!(breaker.current_state_at(now), BreakerState::Open);
        assert!(!breaker.is_available_at(now));
    }

    #[test]
    fn test_first_trip_keeps_initial_backoff() {
        let now = Instant::now();
        let breaker = tripped_at(now);
        assert_eq!(breaker.backoff(), INITIAL_BACKOFF);
    }

    #[test]
    fn test_open_until_backoff_elapses() {
        let now = Instant::now();
        let breaker = tripped_at(now);

        assert_eq!(
            breaker.current_state_at(now + Duration::from_secs(29)),
            BreakerState::Open
        );
        assert_eq!(
            breaker.current_state_at(now + Duration::from_secs(30)),
            BreakerState::HalfOpen
        );
        assert!(breaker.is_available_at(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_half_open_read_does_not_mutate() {
        let now = Instant::now();
        let breaker = tripped_at(now);
        let later = now + Duration::from_secs(31);

        assert_eq!(breaker.current_state_at(later), BreakerState::HalfOpen);
        assert_eq!(breaker.current_state_at(later), BreakerState::HalfOpen);
        // Reading at an earlier instant still sees the stored open state
        assert_eq!(breaker.current_state_at(now), BreakerState::Open);
    }

    #[test]
    fn test_failure_while_open_is_noop() {
        let now = Instant::now();
        let mut breaker = tripped_at(now);
        let later = now + Duration::from_secs(10);

        assert!(!breaker.record_failure_at(later));
        assert_eq!(breaker.backoff(), INITIAL_BACKOFF);
        assert_eq!(breaker.retry_in_at(later), Duration::from_secs(20));
    }

    #[test]
    fn test_failed_probe_doubles_backoff() {
        let now = Instant::now();
        let mut breaker = tripped_at(now);
        let probe = now + Duration::from_secs(31);

        assert!(breaker.record_failure_at(probe));
        assert_eq!(breaker.current_state_at(probe), BreakerState::Open);
        assert_eq!(breaker.backoff(), INITIAL_BACKOFF * 2);

        // The new window starts at the probe, not the first trip
        assert_eq!(
            breaker.current_state_at(probe + Duration::from_secs(59)),
            BreakerState::Open
        );
        assert_eq!(
            breaker.current_state_at(probe + Duration::from_secs(60)),
            BreakerState::HalfOpen
        );
    }

    #[test]
    fn test_backoff_converges_to_cap() {
        let mut now = Instant::now();
        let mut breaker = tripped_at(now);

        for _ in 0..20 {
            now += breaker.backoff() + Duration::from_secs(1);
            assert_eq!(breaker.current_state_at(now), BreakerState::HalfOpen);
            assert!(breaker.record_failure_at(now));
            assert!(breaker.backoff() <= MAX_BACKOFF);
        }

        assert_eq!(breaker.backoff(), MAX_BACKOFF);
    }

    #[test]
    fn test_success_resets_from_any_state() {
        let now = Instant::now();

        let mut closed = HealthBreaker::default();
        closed.record_failure_at(now);
        closed.record_success();
        assert_eq!(closed.consecutive_failures(), 0);

        let mut open = tripped_at(now);
        open.record_success();
        assert_eq!(open.current_state_at(now), BreakerState::Closed);

        let mut probing = tripped_at(now);
        let probe = now + Duration::from_secs(31);
        probing.record_failure_at(probe);
        probing.record_success();
        assert_eq!(probing.current_state_at(probe), BreakerState::Closed);
        assert_eq!(probing.consecutive_failures(), 0);
        assert_eq!(probing.backoff(), INITIAL_BACKOFF);
    }

    #[test]
    fn test_trip_then_recover_scenario() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::default();

        let first_two: Vec<bool> = (0..2).map(|_| breaker.record_failure_at(now)).collect();
        assert_eq!(breaker.current_state_at(now), BreakerState::Closed);
        assert!(breaker.is_available_at(now));

        let third = breaker.record_failure_at(now);
        assert_eq!([first_two[0], first_two[1], third], [false, false, true]);
        assert_eq!(breaker.current_state_at(now), BreakerState::Open);
        assert!(!breaker.is_available_at(now));

        let later = now + Duration::from_secs(31);
        assert_eq!(breaker.current_state_at(later), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.current_state_at(later), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_derive_state_leaves_non_open_alone() {
        let now = Instant::now();
        let long_ago = Duration::from_secs(3600);
        assert_eq!(
            derive_state(BreakerState::Closed, None, long_ago, now),
            BreakerState::Closed
        );
        assert_eq!(
            derive_state(BreakerState::Open, None, long_ago, now),
            BreakerState::Open
        );
        assert_eq!(
            derive_state(BreakerState::Open, Some(now), Duration::ZERO, now),
            BreakerState::HalfOpen
        );
    }

    #[test]
    fn test_record_outcome_reports_trip_and_recovery() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::default();
        let down: Result<(), UpstreamError> =
            Err(UpstreamError::Connection("connection refused".to_string()));

        assert_eq!(breaker.record_outcome_at(&down, now), None);
        assert_eq!(breaker.record_outcome_at(&down, now), None);
        assert_eq!(
            breaker.record_outcome_at(&down, now),
            Some(BreakerTransition::Tripped)
        );

        let later = now + Duration::from_secs(31);
        let ok: Result<(), UpstreamError> = Ok(());
        assert_eq!(
            breaker.record_outcome_at(&ok, later),
            Some(BreakerTransition::Recovered)
        );
        assert_eq!(breaker.record_outcome_at(&ok, later), None);
    }

    #[test]
    fn test_record_outcome_ignores_permanent_errors() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::default();
        let denied: Result<(), UpstreamError> =
            Err(UpstreamError::Authentication("invalid key".to_string()));

        for _ in 0..10 {
            assert_eq!(breaker.record_outcome_at(&denied, now), None);
        }
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.is_available_at(now));
    }

    #[test]
    fn test_status_messages() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::default();
        assert!(breaker.status_message_at("Claude API", now).contains("healthy"));

        for _ in 0..3 {
            breaker.record_failure_at(now);
        }
        let open = breaker.status_message_at("Claude API", now + Duration::from_secs(10));
        assert!(open.contains("unreachable"));
        assert!(open.contains("20s"));

        let probing = breaker.status_message_at("Claude API", now + Duration::from_secs(31));
        assert!(probing.contains("recovering"));
    }

    #[test]
    fn test_custom_threshold() {
        let now = Instant::now();
        let mut breaker = HealthBreaker::new(BreakerConfig {
            failure_threshold: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
        });

        assert!(breaker.record_failure_at(now));
        let probe = now + Duration::from_secs(1);
        assert!(breaker.record_failure_at(probe));
        assert_eq!(breaker.backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
        assert_eq!(BreakerState::Closed.to_string(), "closed");
    }
}
