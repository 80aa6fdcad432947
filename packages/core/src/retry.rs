// ABOUTME: Exponential backoff retry policy with optional jitter
// ABOUTME: Sleeping goes through the Sleeper trait so tests can run without real time passing

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::constants::GATEWAY_STATUS_ATTEMPTS;

/// Abstraction over sleeping between retry attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry policy: an initial attempt followed by up to `max_retries` retries.
///
/// The delay before retry `n` (1-based) is `base_delay * 2^(n-1)`, capped at `max_delay`,
/// plus a uniformly random jitter in `[0, jitter]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        let max_delay = base_delay.saturating_mul(1u32 << max_retries.min(16));
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Policy for sandbox lock acquisition: 3 retries after 1s, 2s and 4s
    pub fn lock_acquire() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Policy for gateway status lookups: 3 attempts in total, 1s then 2s apart
    pub fn gateway_status() -> Self {
        Self::new(GATEWAY_STATUS_ATTEMPTS - 1, Duration::from_secs(1))
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff delay (without jitter) before the given 1-based retry
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before the given 1-based retry, including jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        if self.jitter.is_zero() {
            return base;
        }

        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or retries run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: F,
        should_retry: R,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retry = attempt;
                    if retry > self.max_retries || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(retry);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after failure");
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Repeat `op` until it reports `true` or retries run out. Returns whether it succeeded.
    pub async fn retry_until<F, Fut>(&self, sleeper: &dyn Sleeper, mut op: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut attempt = 1;
        loop {
            if op(attempt).await {
                return true;
            }
            if attempt > self.max_retries {
                return false;
            }
            sleeper.sleep(self.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::lock_acquire()
    }
}
