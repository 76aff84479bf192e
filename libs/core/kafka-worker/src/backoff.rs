//! Exponential backoff with proportional jitter.
//!
//! `delay(n) = min(base * 2^n, max) + jitter`, jitter uniform in
//! `[0, jitter_ratio * min(base * 2^n, max)]`. Jitter is computed from the
//! clamped base component and never fed back into the next attempt.

use std::time::Duration;

/// Default jitter ratio: up to 10% of the base delay
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// Set the jitter ratio, clamped to `[0, 1]`
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Deterministic component: `min(base * 2^attempt, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Upper bound of the jitter added for `attempt`
    pub fn max_jitter(&self, attempt: u32) -> Duration {
        self.base_delay(attempt).mul_f64(self.jitter_ratio)
    }

    /// Delay for `attempt` with `sample` in `[0, 1)` selecting the jitter
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        self.base_delay(attempt) + self.max_jitter(attempt).mul_f64(sample)
    }

    /// Delay for `attempt` with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }

    /// `delay_with_sample` in whole seconds for second-resolution schedules.
    ///
    /// Rounded to the nearest second so sub-second jitter still spreads retries,
    /// then kept inside `[base, base + max_jitter]`.
    pub fn delay_secs_with_sample(&self, attempt: u32, sample: f64) -> u64 {
        let low = self.base_delay(attempt).as_secs_f64().ceil();
        let high = (self.base_delay(attempt) + self.max_jitter(attempt))
            .as_secs_f64()
            .floor()
            .max(low);
        self.delay_with_sample(attempt, sample)
            .as_secs_f64()
            .round()
            .clamp(low, high) as u64
    }

    /// Whole-second delay for `attempt` with random jitter
    pub fn delay_secs(&self, attempt: u32) -> u64 {
        self.delay_secs_with_sample(attempt, rand::random::<f64>())
    }
}

impl Default for BackoffPolicy {
    /// 5 second base, 10 minute ceiling
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(600))
    }
}
