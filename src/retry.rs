use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration with jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Jitter factor (0.0 to 1.0) - adds randomness to backoff
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_jitter_factor() -> f64 { 0.2 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Backoff before the retry that follows `attempt` (1-indexed).
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_backoff_ms`, then jittered
    /// and capped again.
    pub fn backoff_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let exp_backoff = (self.base_backoff_ms as f64) * 2_f64.powi(exponent);
        let capped_backoff = exp_backoff.min(self.max_backoff_ms as f64);

        let jitter_range = capped_backoff * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_backoff = (capped_backoff + jitter)
            .max(0.0)
            .min(self.max_backoff_ms as f64);

        Duration::from_millis(final_backoff as u64)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_for(attempt, &mut rand::thread_rng())
    }
}
