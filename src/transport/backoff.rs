use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delays with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exp = self.config.multiplier.powi(self.attempt.min(64) as i32);
        let nominal = self.config.base.as_secs_f64() * exp;
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        let secs = (nominal * factor).min(self.config.max.as_secs_f64()).max(0.0);
        self.attempt += 1;
        Some(Duration::from_secs_f64(secs))
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
