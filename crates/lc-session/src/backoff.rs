//! Reconnect pacing
//!
//! Delay `n` (0-based) is `initial * multiplier^n`, capped at `max`, plus a
//! random extra of up to `jitter` times that delay.

use std::time::Duration;

use rand::Rng;

use lc_core::config::BackoffConfig;

/// Exponential backoff with jitter between connection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
        }
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self::from_config(&BackoffConfig {
            initial,
            max,
            multiplier,
            jitter,
        })
    }

    /// Delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let secs = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent);
        let max = self.config.max.as_secs_f64();
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max
        }
    }

    /// The delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter <= 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.config.jitter * rand::thread_rng().gen::<f64>();
        base + Duration::from_secs_f64(extra)
    }
}
