//! Bounded waiting with exponential backoff.
//!
//! Two shapes of waiting are supported: [`RetryPolicy::execute`] re-runs an
//! operation while it fails with a retryable error, and [`RetryPolicy::poll`]
//! re-probes a value that materializes asynchronously on the remote side
//! (a token secret being populated, a CSR being signed) until it shows up or
//! the attempt budget is spent.

use std::future::Future;
use std::time::Duration;

/// Classifies errors as transient or permanent.
pub trait Retryable {
    /// Whether a retry of the failed operation may succeed.
    fn is_retryable(&self) -> bool;
}

/// Attempt budget and backoff curve.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Sleep before the first retry
    pub initial_delay: Duration,
    /// Ceiling for any single sleep
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Add up to 25% random extra to each sleep
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// Three retries starting at 200ms, doubling up to 5s.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that retries `max_retries` times without sleeping.
    #[must_use]
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, initial: Duration) -> Self {
        self.initial_delay = initial;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, ceiling: Duration) -> Self {
        self.max_delay = ceiling;
        self
    }

    /// Make every delay deterministic.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Runs operations and probes under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before retry number `attempt + 1`.
    ///
    /// Grows by `multiplier` per attempt, is capped at `max_delay`, and gets
    /// up to a quarter extra on top when jitter is on.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ceiling = self.config.max_delay.as_millis() as f64;
        let millis = (self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent))
        .min(ceiling);

        let millis = if self.config.jitter {
            millis * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            millis
        };
        Duration::from_millis(millis as u64)
    }

    async fn backoff(&self, attempt: u32) {
        let pause = self.delay_for_attempt(attempt);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    /// Whether a failure on attempt `attempt` (zero based) earns another try.
    #[must_use]
    pub fn should_retry<E: Retryable>(&self, error: &E, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.config.max_retries
    }

    /// Run `operation`, retrying it while it fails with a retryable error.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or the last transient one once the
    /// budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !self.should_retry(&error, attempt) {
                return Err(error);
            }
            tracing::debug!(attempt = attempt + 1, "retrying after transient failure");
            self.backoff(attempt).await;
            attempt += 1;
        }
    }

    /// Probe for a value until it is present, sleeping between probes.
    ///
    /// The probe runs at most `max_retries + 1` times. Returns `Ok(None)` when
    /// the budget is exhausted without the value appearing.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the probe; errors are not retried.
    pub async fn poll<F, Fut, T, E>(&self, mut probe: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let mut attempt = 0;
        loop {
            if let Some(value) = probe().await? {
                return Ok(Some(value));
            }
            if attempt >= self.config.max_retries {
                return Ok(None);
            }
            self.backoff(attempt).await;
            attempt += 1;
        }
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}
