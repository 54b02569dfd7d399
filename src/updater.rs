//! Optimistic-concurrency update loop.
//!
//! [`update_with_retry`] applies a mutation to an in-memory copy and writes
//! it. When the store rejects the write as stale, the loop sleeps for the
//! next [`Backoff`] delay, re-fetches the resource, re-applies the mutation
//! to the fresh copy, and writes again. Any error other than a conflict ends
//! the loop immediately.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::BackoffConfig;
use crate::store::{Resource, ResourceApi, ResourceKey, ResourceKind, StoreError};

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied to the delay after each retry.
    pub factor: f64,
    /// Fraction of each delay added as random extra wait (0.0 - 1.0).
    pub jitter: f64,
    /// Maximum number of write attempts, including the first.
    pub steps: u32,
    /// Upper bound for any single delay, before jitter.
    pub cap: Duration,
}

impl Default for Backoff {
    /// 10ms, x5, 10% jitter, 4 attempts.
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            steps: 4,
            cap: Duration::from_secs(1),
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            factor: config.factor,
            jitter: config.jitter,
            steps: config.steps,
            cap: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Backoff {
    /// Delays before each retry, without jitter.
    ///
    /// Yields `steps - 1` values: no delay follows the final attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = self.steps.saturating_sub(1);
        let mut next = self.initial.min(self.cap);
        (0..retries).map(move |_| {
            let current = next;
            next = scale(next, self.factor).min(self.cap);
            current
        })
    }

    /// Add up to `jitter * base` of random wait to `base`.
    pub fn with_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let fraction: f64 = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.saturating_add(scale(base, fraction))
    }
}

/// `duration * factor`, saturating instead of panicking on overflow.
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Why a retried update gave up.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// A non-conflict store failure on write or refresh.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Every attempt conflicted.
    #[error("{kind} {key}: still conflicting after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource address.
        key: ResourceKey,
        /// Write attempts made.
        attempts: u32,
        /// The final conflict reported by the store.
        last: StoreError,
    },
}

/// Apply `mutate` to `resource` and write it, refreshing and re-applying on
/// version conflicts.
///
/// `mutate` must be idempotent: it runs once on the caller's copy and once
/// more on every refreshed copy. Returns the stored resource as written.
///
/// # Errors
///
/// [`UpdateError::RetryExhausted`] once `backoff.steps` writes have all
/// conflicted; [`UpdateError::Store`] for any other failure, including a
/// failed refresh.
pub async fn update_with_retry<R, A, M>(
    api: &A,
    resource: R,
    mutate: M,
    backoff: &Backoff,
) -> Result<R, UpdateError>
where
    R: Resource,
    A: ResourceApi<R> + ?Sized,
    M: Fn(&mut R),
{
    let key = resource.key();
    let mut current = resource;
    mutate(&mut current);

    let mut delays = backoff.delays();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let err = match api.update(&current).await {
            Ok(written) => {
                debug!(kind = %R::KIND, key = %key, attempt, "update applied");
                return Ok(written);
            }
            Err(err) if err.is_conflict() => err,
            Err(err) => return Err(err.into()),
        };

        let Some(delay) = delays.next() else {
            return Err(UpdateError::RetryExhausted {
                kind: R::KIND,
                key,
                attempts: attempt,
                last: err,
            });
        };

        let delay = backoff.with_jitter(delay);
        warn!(
            kind = %R::KIND,
            key = %key,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "update conflicted, refreshing"
        );
        tokio::time::sleep(delay).await;

        current = api.get(&key).await?;
        mutate(&mut current);
    }
}
