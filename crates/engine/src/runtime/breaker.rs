//! Per-handler circuit breaker.
//!
//! A breaker trips open after `failure_threshold` consecutive failures, rejects calls until the
//! open duration has elapsed since the last failure, then admits exactly one trial call. The
//! trial's outcome either closes the breaker or re-opens it with a fresh timer.
//!
//! All state lives behind one `std::sync::Mutex`; the lock is taken only for short, synchronous
//! transitions and is never held across an `.await`. Callers obtain a [`BreakerPermit`] before
//! invoking the handler and report the outcome through it.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry hint given to callers rejected while a half-open trial is in flight.
const TRIAL_IN_FLIGHT_RETRY: Duration = Duration::from_secs(1);

/// How long the breaker stays open after a failed half-open trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Re-open for the configured base duration.
    #[default]
    Fixed,
    /// Multiply the previous open duration by `factor`, capped at `max_secs`.
    Exponential { factor: f64, max_secs: u64 },
}

impl ReopenPolicy {
    fn next(self, previous: Duration, base: Duration) -> Duration {
        match self {
            ReopenPolicy::Fixed => base,
            ReopenPolicy::Exponential { factor, max_secs } => {
                let max = Duration::from_secs(max_secs).max(base);
                let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
                previous.mul_f64(factor).min(max)
            }
        }
    }
}

/// Thresholds applied to every handler's breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub reopen: ReopenPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            reopen: ReopenPolicy::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub retry_after: Duration,
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure: Option<String>,
    current_open: Duration,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    handler_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(handler_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            handler_id: handler_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_failure: None,
                current_open: config.open_duration,
                trial_in_flight: false,
            }),
        }
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Asks for permission to call the handler.
    ///
    /// An open breaker whose timer has elapsed moves to half-open and hands out the single trial
    /// permit; everyone else is rejected with the time left until the next trial.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, Rejection> {
        let mut inner = self.lock();
        let now = Instant::now();
        let kind = match inner.state {
            BreakerState::Closed => PermitKind::Normal,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(inner.current_open);
                if elapsed < inner.current_open {
                    return Err(Rejection {
                        retry_after: inner.current_open - elapsed,
                        last_failure: inner.last_failure.clone(),
                    });
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(handler = %self.handler_id, "circuit half-open; admitting trial call");
                PermitKind::Trial
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(Rejection {
                        retry_after: TRIAL_IN_FLIGHT_RETRY,
                        last_failure: inner.last_failure.clone(),
                    });
                }
                inner.trial_in_flight = true;
                PermitKind::Trial
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            kind,
            reported: false,
        })
    }

    /// Effective state, treating an expired open window as half-open.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        effective_state(&inner, Instant::now())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let state = effective_state(&inner, now);
        let retry_after_ms = match state {
            BreakerState::Open => inner
                .last_failure_at
                .map(|at| inner.current_open.saturating_sub(now.saturating_duration_since(at)).as_millis() as u64),
            _ => None,
        };
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_duration_ms: inner.current_open.as_millis() as u64,
            retry_after_ms,
            last_failure: inner.last_failure.clone(),
        }
    }

    /// Forces the breaker closed and clears its failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.last_failure = None;
        inner.current_open = self.config.open_duration;
        inner.trial_in_flight = false;
        info!(handler = %self.handler_id, "circuit reset by operator");
    }

    fn on_success(&self, kind: PermitKind) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if kind == PermitKind::Trial {
            inner.state = BreakerState::Closed;
            inner.trial_in_flight = false;
            inner.current_open = self.config.open_duration;
            info!(handler = %self.handler_id, "trial call succeeded; circuit closed");
        }
    }

    fn on_failure(&self, kind: PermitKind, reason: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(reason.to_string());

        match (kind, inner.state) {
            (PermitKind::Trial, _) => {
                let reopen = self.config.reopen.next(inner.current_open, self.config.open_duration);
                inner.state = BreakerState::Open;
                inner.trial_in_flight = false;
                inner.last_failure_at = Some(now);
                inner.current_open = reopen;
                warn!(
                    handler = %self.handler_id,
                    open_ms = reopen.as_millis() as u64,
                    reason = %reason,
                    "trial call failed; circuit re-opened"
                );
            }
            (PermitKind::Normal, BreakerState::Closed) => {
                inner.last_failure_at = Some(now);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.current_open = self.config.open_duration;
                    warn!(
                        handler = %self.handler_id,
                        failures = inner.consecutive_failures,
                        reason = %reason,
                        "failure threshold reached; circuit opened"
                    );
                } else {
                    debug!(handler = %self.handler_id, failures = inner.consecutive_failures, "handler failure recorded");
                }
            }
            // A call admitted before the breaker opened; it must not extend the open window.
            (PermitKind::Normal, _) => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn effective_state(inner: &BreakerInner, now: Instant) -> BreakerState {
    match (inner.state, inner.last_failure_at) {
        (BreakerState::Open, Some(at)) if now.saturating_duration_since(at) >= inner.current_open => BreakerState::HalfOpen,
        (state, _) => state,
    }
}

/// Permission to make one call. Report the outcome with [`success`](Self::success),
/// [`failure`](Self::failure), or [`release`](Self::release) for a call that says nothing about
/// the handler's health. Dropping an unreported trial permit frees the trial slot.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    reported: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.kind);
    }

    pub fn failure(mut self, reason: &str) {
        self.reported = true;
        self.breaker.on_failure(self.kind, reason);
    }

    /// Ends the call without counting it. The failure count is kept; a trial slot is freed and the
    /// breaker stays half-open.
    pub fn release(mut self) {
        self.reported = true;
        if self.kind == PermitKind::Trial {
            self.breaker.release_trial();
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.kind == PermitKind::Trial {
            self.breaker.release_trial();
        }
    }
}
