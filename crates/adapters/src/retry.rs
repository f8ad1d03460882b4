use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

/// Retry policy for one provider call. The delay grows linearly with the
/// attempt number; rate-limited providers override it per error.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_attempts: usize, base_sleep: Duration) -> Self {
        Self {
            max_attempts,
            base_sleep,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_sleep: Duration::from_secs(2),
        }
    }
}

pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=config.max_attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    "[call_with_retry] attempt {}/{} failed: {}",
                    attempt, config.max_attempts, err
                );
                if attempt < config.max_attempts {
                    thread::sleep(config.base_sleep.saturating_mul(attempt as u32));
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(config.max_attempts, err))
}
