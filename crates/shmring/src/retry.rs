use std::time::Duration;

/// Backoff for the reader's attach handshake while the writer is still
/// creating the segment, its semaphores, or the magic.
///
/// Defaults: 20 attempts starting at 100µs, doubling up to 2ms, about 30ms
/// in the worst case. Readers started well ahead of their writer should
/// raise `max_attempts`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay after the first failed attempt (doubles each attempt)
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_micros(100),
            max_delay: Duration::from_millis(2),
        }
    }
}

impl RetryConfig {
    /// Retry for roughly `total` with the default backoff curve.
    pub fn patient(total: Duration) -> Self {
        let defaults = Self::default();
        let attempts = total.as_micros() / defaults.max_delay.as_micros().max(1);
        Self {
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX).max(defaults.max_attempts),
            ..defaults
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
