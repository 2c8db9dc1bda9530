//! Reconnect policy — jittered exponential back-off for sessions that
//! drop unexpectedly.
//!
//! Backoff keeps the retry *rate* bounded under flapping connectivity;
//! whether the *count* is bounded is a configuration decision
//! (`max_attempts = 0` retries forever).

use std::time::Duration;

use cb_domain::config::ReconnectConfig;

/// Decides when (and whether) the next reconnect attempt happens.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(cfg.initial_delay_secs),
            max_delay: Duration::from_secs(cfg.max_delay_secs),
            backoff_factor: cfg.backoff_factor,
            max_attempts: cfg.max_attempts,
        }
    }

    /// How long to wait before attempt `attempt` (0-indexed). Grows by
    /// `backoff_factor` per attempt up to `max_delay`, plus up to a
    /// quarter of that in jitter so dropped sessions do not all hammer
    /// the service at once.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = capped_ms * 0.25 * jitter_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    /// Whether the given attempt number exceeds the configured cap.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

/// Fraction in [0, 1) derived from the attempt number. Deterministic on
/// purpose: attempt 0 gets zero jitter, and tests can rely on the exact
/// delays.
fn jitter_fraction(attempt: u32) -> f64 {
    // Knuth's multiplicative hash constant.
    let hash = attempt.wrapping_mul(2_654_435_761);
    (hash as f64) / (u32::MAX as f64)
}
