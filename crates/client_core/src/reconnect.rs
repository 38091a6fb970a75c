use std::time::Duration;

/// Bounded exponential backoff for the connection session.
///
/// Delays grow as `base_delay * growth ^ attempt`, capped at `max_delay`.
/// Once the attempt counter passes `max_attempts` the session stops
/// scheduling retries; after `cooldown` the counter resets so a later,
/// deliberate connect is not permanently blocked.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            growth: 1.5,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.growth.powi(attempt as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Whether the attempt counter has passed the retry bound.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
