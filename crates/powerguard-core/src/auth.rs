use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::{deadline_after, lock};

/// Longest reason string shown in an authentication prompt.
pub const MAX_REASON_LEN: usize = 200;

// ---------------------------------------------------------------------------
// AuthChallenge
// ---------------------------------------------------------------------------

/// The platform prompt (biometric, optionally with password fallback).
///
/// Returns `Ok(())` on success. Cancellation is reported through the
/// cancellation variants of [`AuthError`].
pub trait AuthChallenge: Send + Sync {
    fn evaluate<'a>(
        &'a self,
        reason: &'a str,
        allow_fallback: bool,
    ) -> BoxFuture<'a, Result<(), AuthError>>;
}

// ---------------------------------------------------------------------------
// AuthPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    pub allow_password_fallback: bool,
    /// Accept a success from within the cache window without prompting.
    pub allow_cached: bool,
}

impl AuthPolicy {
    /// Fallback allowed, recent success reused.
    pub const fn standard() -> Self {
        Self {
            allow_password_fallback: true,
            allow_cached: true,
        }
    }

    /// Always prompt, fallback allowed.
    pub const fn fresh() -> Self {
        Self {
            allow_password_fallback: true,
            allow_cached: false,
        }
    }

    /// Always prompt, biometrics only.
    pub const fn biometric_only() -> Self {
        Self {
            allow_password_fallback: false,
            allow_cached: false,
        }
    }

    pub fn without_fallback(mut self) -> Self {
        self.allow_password_fallback = false;
        self
    }
}

// ---------------------------------------------------------------------------
// AuthLimits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthLimits {
    /// Failures within `failure_window` that trigger a lockout.
    pub max_failures: u32,
    pub failure_window: Duration,
    /// How long attempts are kept at all. Bounds memory only.
    pub retention: Duration,
    pub cache_window: Duration,
    pub max_entries: usize,
}

impl Default for AuthLimits {
    fn default() -> Self {
        Self {
            max_failures: 3,
            failure_window: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            cache_window: Duration::from_secs(10),
            max_entries: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub at: Instant,
    pub success: bool,
}

#[derive(Debug, Default)]
struct AttemptLog {
    attempts: VecDeque<Attempt>,
    last_success: Option<Instant>,
    in_flight: bool,
}

impl AttemptLog {
    fn prune(&mut self, now: Instant, limits: &AuthLimits) {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(front.at) > limits.retention {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        while self.attempts.len() > limits.max_entries {
            self.attempts.pop_front();
        }
    }

    /// Time until the failure count inside the window drops below the
    /// threshold, or `None` if not locked out.
    fn lockout_remaining(&self, now: Instant, limits: &AuthLimits) -> Option<Duration> {
        let threshold = limits.max_failures as usize;
        if threshold == 0 {
            return None;
        }
        let recent: Vec<Instant> = self
            .attempts
            .iter()
            .filter(|a| !a.success && now.duration_since(a.at) < limits.failure_window)
            .map(|a| a.at)
            .collect();
        if recent.len() < threshold {
            return None;
        }
        // Once this failure leaves the window, fewer than `threshold` remain.
        let pivot = recent[recent.len() - threshold];
        let expires = deadline_after(pivot, limits.failure_window);
        Some(expires.saturating_duration_since(now))
    }

    fn cached_success(&self, now: Instant, window: Duration) -> bool {
        self.last_success
            .map(|at| now.duration_since(at) < window)
            .unwrap_or(false)
    }

    fn record(&mut self, at: Instant, success: bool, limits: &AuthLimits) {
        // Keep the log monotonic even if a caller's clock reading lags.
        let at = match self.attempts.back() {
            Some(last) if last.at > at => last.at,
            _ => at,
        };
        self.attempts.push_back(Attempt { at, success });
        if success {
            self.last_success = Some(at);
        }
        self.prune(at, limits);
    }
}

/// Clears the in-flight flag when a challenge ends or is abandoned.
struct InFlight<'a>(&'a Mutex<AttemptLog>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.0).in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// AuthGate
// ---------------------------------------------------------------------------

/// Wraps the platform challenge with rate limiting and success caching.
pub struct AuthGate {
    challenge: Arc<dyn AuthChallenge>,
    limits: AuthLimits,
    log: Mutex<AttemptLog>,
}

impl AuthGate {
    pub fn new(challenge: Arc<dyn AuthChallenge>, limits: AuthLimits) -> Self {
        Self {
            challenge,
            limits,
            log: Mutex::new(AttemptLog::default()),
        }
    }

    pub fn limits(&self) -> AuthLimits {
        self.limits
    }

    /// Authenticate the user for `reason`.
    ///
    /// Checks, in order: the failure rate limit, the reason string, and the
    /// success cache. Only then is the challenge shown. Cancellations are not
    /// recorded as attempts.
    pub async fn authenticate(&self, reason: &str, policy: AuthPolicy) -> Result<(), AuthError> {
        let reason = reason.trim();
        {
            let now = Instant::now();
            let mut log = lock(&self.log);
            log.prune(now, &self.limits);

            if let Some(retry_after) = log.lockout_remaining(now, &self.limits) {
                warn!(
                    retry_after_secs = retry_after.as_secs(),
                    "authentication rate limited"
                );
                return Err(AuthError::RateLimited { retry_after });
            }

            validate_reason(reason)?;

            if policy.allow_cached && log.cached_success(now, self.limits.cache_window) {
                debug!("reusing recent authentication");
                return Ok(());
            }

            if log.in_flight {
                return Err(AuthError::InProgress);
            }
            log.in_flight = true;
        }
        let _in_flight = InFlight(&self.log);

        let outcome = self
            .challenge
            .evaluate(reason, policy.allow_password_fallback)
            .await;

        match &outcome {
            Ok(()) => {
                info!("authentication succeeded");
                lock(&self.log).record(Instant::now(), true, &self.limits);
            }
            Err(e) if e.counts_as_failure() => {
                warn!(error = %e, "authentication failed");
                lock(&self.log).record(Instant::now(), false, &self.limits);
            }
            Err(e) if e.is_cancellation() => {
                info!(error = %e, "authentication dismissed; not recorded");
            }
            Err(e) => {
                debug!(error = %e, "authentication not completed; not recorded");
            }
        }
        outcome
    }

    /// Remaining lockout, if the failure threshold is currently reached.
    pub fn lockout_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.log).lockout_remaining(now, &self.limits)
    }

    /// Snapshot of the retained attempts, oldest first.
    pub fn attempts(&self) -> Vec<Attempt> {
        lock(&self.log).attempts.iter().copied().collect()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.log).in_flight
    }

    /// Forget a cached success so the next request prompts again.
    pub fn invalidate_cache(&self) {
        lock(&self.log).last_success = None;
    }
}

fn validate_reason(reason: &str) -> Result<(), AuthError> {
    if reason.is_empty() {
        return Err(AuthError::InvalidReason("reason must not be empty".into()));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(AuthError::InvalidReason(format!(
            "reason exceeds {MAX_REASON_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
