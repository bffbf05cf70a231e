use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 500,
            max_ms: 60_000,
        }
    }
}

/// Exponential backoff with a cap. `attempt` is 1-based: the first retry
/// waits `base_ms`.
pub fn backoff_delay_ms(attempt: u32, config: &RetryConfig) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    config
        .base_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_ms)
}
