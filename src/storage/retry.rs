//! Retries of storage writes.

use std::{future::Future, time::Duration};

use anyhow::{anyhow, Context};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::{settings::PersistenceSettings, storage::StorageResult};

/// How often and how patiently a storage operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// The time a single attempt may take before it counts as failed.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// The backoff after the given failed attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PersistenceSettings::default())
    }
}

impl From<&PersistenceSettings> for RetryPolicy {
    fn from(settings: &PersistenceSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff),
            max_backoff: Duration::from_millis(settings.max_backoff),
            attempt_timeout: Duration::from_millis(settings.attempt_timeout),
        }
    }
}

/// Runs `attempt` until it succeeds or the policy is exhausted.
///
/// Each attempt is bounded by the attempt timeout. Failed attempts are followed by an
/// exponentially growing backoff. The error of the last attempt is returned.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut tries = 0;
    loop {
        let error = match timeout(policy.attempt_timeout, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => anyhow!("timed out after {:?}", policy.attempt_timeout),
        };
        tries += 1;
        if tries >= policy.max_attempts {
            return Err(error).context(format!("{} failed after {} attempt(s)", operation, tries));
        }

        let backoff = policy.backoff_for_attempt(tries - 1);
        warn!(
            "{} failed (attempt {}/{}): {}. retrying in {:?}",
            operation, tries, policy.max_attempts, error, backoff
        );
        sleep(backoff).await;
    }
}
