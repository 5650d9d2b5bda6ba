use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Rate (operations/second) substituted when a loop is handed an invalid rate
pub const DEFAULT_RATE: f64 = 1.0;

/// Upper bound on a throttle period, reached only by vanishingly small rates
pub const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest single sleep inside a throttle wait; bounds how late a stop is noticed
pub const THROTTLE_SLICE: Duration = Duration::from_millis(50);

/// Validate a rate coming from the control surface
pub fn validate_rate(value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(PipelineError::config(format!(
            "rate must be a positive finite number, got {}",
            value
        )))
    }
}

/// An `f64` rate shared between a control thread and an agent loop
#[derive(Debug)]
pub struct AtomicRate(AtomicU64);

impl AtomicRate {
    /// Create a new shared rate holding `value`
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Get the current rate
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Set the rate; the owning loop picks it up on its next throttle
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Outcome of one throttle call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// The period elapsed at the requested rate
    Paced,
    /// The requested rate was invalid and [`DEFAULT_RATE`] was used instead
    Substituted { requested: f64 },
    /// The wait was abandoned because the loop was told to stop
    Cancelled,
}

/// Spaces successive operations of one loop at least `1 / rate` seconds apart.
///
/// The rate is passed on every call, so a change made between calls applies
/// to the next wait. The first call never waits.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last: Option<Instant>,
}

impl RateLimiter {
    /// Create a new limiter whose first throttle returns immediately
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Wait out the period for `rate`
    pub fn throttle(&mut self, rate: f64) -> Pacing {
        self.throttle_while(rate, || true)
    }

    /// Wait out the period for `rate`, giving up early once `keep_going`
    /// returns false. The condition is polled every [`THROTTLE_SLICE`].
    pub fn throttle_while(&mut self, rate: f64, keep_going: impl Fn() -> bool) -> Pacing {
        let (rate, pacing) = match validate_rate(rate) {
            Ok(rate) => (rate, Pacing::Paced),
            Err(_) => (DEFAULT_RATE, Pacing::Substituted { requested: rate }),
        };
        let period = Duration::try_from_secs_f64(1.0 / rate)
            .unwrap_or(MAX_PERIOD)
            .min(MAX_PERIOD);

        if let Some(last) = self.last {
            let deadline = last + period;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if !keep_going() {
                    return Pacing::Cancelled;
                }
                thread::sleep((deadline - now).min(THROTTLE_SLICE));
            }
        }

        self.last = Some(Instant::now());
        pacing
    }
}
