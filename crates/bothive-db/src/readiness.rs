use std::time::Duration;

use bothive_common::{Error, Result};
use tracing::{info, warn};

/// Bounded polling policy used while waiting for the target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(1))
    }
}

/// Call `connect` until it succeeds or the policy's attempts run out,
/// sleeping `interval` between attempts.
pub async fn wait_until_reachable<T, F>(policy: RetryPolicy, mut connect: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match connect() {
            Ok(value) => {
                if attempt > 1 {
                    info!("database reachable after {attempt} attempt(s)");
                }
                return Ok(value);
            }
            Err(e) => {
                last_error = e.to_string();
                warn!("database not reachable (attempt {attempt}/{max_attempts}): {last_error}");
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(Error::Connectivity {
        attempts: max_attempts,
        last_error,
    })
}
