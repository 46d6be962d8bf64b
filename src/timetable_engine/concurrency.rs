//! Additive-increase/multiplicative-decrease concurrency limiter.
//!
//! One limiter instance gates one fan-out stage of one request. The
//! transport reports success/failure signals; the orchestrator blocks task
//! admissions on [`AimdLimiter::acquire`] so that at most `floor(limit)`
//! upstream calls of that stage are in flight.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use super::error::{EngineError, EngineResult};

const INCREASE_STEP: f64 = 1.0;
const DECREASE_FACTOR: f64 = 0.5;
const SUCCESS_THRESHOLD: u32 = 10;
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct LimiterState {
    current_limit: f64,
    success_streak: u32,
    last_failure: Option<Instant>,
    in_flight: usize,
}

#[derive(Debug)]
pub struct AimdLimiter {
    min: f64,
    max: f64,
    success_threshold: u32,
    failure_cooldown: Duration,
    disabled: bool,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl AimdLimiter {
    /// Creates a dynamic limiter. Bounds must satisfy `0 < min <= initial <= max`.
    pub fn new(initial: usize, min: usize, max: usize) -> EngineResult<Self> {
        if min == 0 || min > initial || initial > max {
            return Err(EngineError::Input(format!(
                "concurrency bounds must satisfy 0 < min <= initial <= max \
                 (got min={min}, initial={initial}, max={max})"
            )));
        }
        Ok(Self {
            min: min as f64,
            max: max as f64,
            success_threshold: SUCCESS_THRESHOLD,
            failure_cooldown: FAILURE_COOLDOWN,
            disabled: false,
            state: Mutex::new(LimiterState {
                current_limit: initial as f64,
                success_streak: 0,
                last_failure: None,
                in_flight: 0,
            }),
            released: Notify::new(),
        })
    }

    /// Creates a forced limiter: a fixed ceiling that ignores all
    /// success/failure reports. Used when callers want a deterministic limit.
    pub fn forced(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1) as f64;
        Self {
            min: ceiling,
            max: ceiling,
            success_threshold: SUCCESS_THRESHOLD,
            failure_cooldown: FAILURE_COOLDOWN,
            disabled: true,
            state: Mutex::new(LimiterState {
                current_limit: ceiling,
                success_streak: 0,
                last_failure: None,
                in_flight: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Shortens the failure cooldown window; the 5 s default is right for
    /// production but too slow for exercising recovery in tests.
    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    fn locked(&self) -> MutexGuard<'_, LimiterState> {
        // The guarded section never panics, but don't let a poisoned lock
        // wedge every request in the process.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current admission ceiling.
    pub fn limit(&self) -> usize {
        self.locked().current_limit.floor() as usize
    }

    /// Records one successful upstream call. After `success_threshold`
    /// consecutive successes outside the failure cooldown, the limit grows
    /// by one step up to `max`.
    pub fn report_success(&self) {
        if self.disabled {
            return;
        }
        let mut state = self.locked();
        state.success_streak += 1;
        if let Some(last_failure) = state.last_failure {
            if last_failure.elapsed() < self.failure_cooldown {
                // Still cooling down: successes don't count toward growth.
                state.success_streak = 0;
                return;
            }
        }
        if state.success_streak >= self.success_threshold {
            state.current_limit = (state.current_limit + INCREASE_STEP).min(self.max);
            state.success_streak = 0;
            drop(state);
            self.released.notify_waiters();
        }
    }

    /// Records one retryable upstream failure: the limit halves (bounded by
    /// `min`) and the success streak restarts.
    pub fn report_failure(&self) {
        if self.disabled {
            debug!("forced limiter ignoring failure report");
            return;
        }
        let mut state = self.locked();
        state.success_streak = 0;
        state.current_limit = (state.current_limit * DECREASE_FACTOR).max(self.min);
        state.last_failure = Some(Instant::now());
    }

    /// Waits until an in-flight slot is available under the current limit.
    ///
    /// The returned permit releases its slot on drop. A limit lowered while
    /// permits are out does not revoke them; it only gates new admissions.
    pub async fn acquire(&self) -> LimiterPermit<'_> {
        loop {
            let released = self.released.notified();
            {
                let mut state = self.locked();
                if state.in_flight < state.current_limit.floor() as usize {
                    state.in_flight += 1;
                    return LimiterPermit { limiter: self };
                }
            }
            released.await;
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.locked().in_flight
    }
}

/// An admission slot held for the duration of one upstream call.
pub struct LimiterPermit<'a> {
    limiter: &'a AimdLimiter,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.locked();
        state.in_flight -= 1;
        drop(state);
        self.limiter.released.notify_waiters();
    }
}
