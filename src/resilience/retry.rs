//! Retry with Exponential Backoff
//! Re-invokes transient failures with jittered, bounded delays

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ClassifyError, ErrorKind, ExchangeError};

/// Jitter spreads each delay uniformly over ±25% of its computed value.
const JITTER_FACTOR: f64 = 0.25;

pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
pub type RetryCallback<E> = Arc<dyn Fn(u32, &E, Duration) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total invocations, including the first one.
    pub max_attempts: u32,
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    pub retryable_errors: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            enable_jitter: true,
            retryable_errors: ErrorKind::DEFAULT_RETRYABLE.to_vec(),
        }
    }
}

impl RetryConfig {
    /// Same algorithm with the multiplier pinned to 1.
    pub fn linear(mut self) -> Self {
        self.backoff_multiplier = 1.0;
        self
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.max_attempts == 0 {
            return Err(ExchangeError::Configuration("max_attempts must be at least 1".into()));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ExchangeError::Configuration(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ExchangeError::Configuration(
                "base_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Backoff for a 1-based attempt with an explicit jitter sample in
    /// `[-1.0, 1.0]`. Clamped to `[0, max_delay]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if self.enable_jitter {
            nanos *= 1.0 + JITTER_FACTOR * jitter.clamp(-1.0, 1.0);
        }

        let max = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, jitter_sample())
    }
}

fn jitter_sample() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

// =====================================================
// RETRY STATS
// =====================================================

/// Aggregated across every call that shares the instance.
#[derive(Debug, Default)]
pub struct RetryStats {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryStatsSnapshot {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.calls,
            &self.attempts,
            &self.retries,
            &self.successes,
            &self.failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// =====================================================
// RETRY POLICY
// =====================================================

pub struct RetryPolicy<E> {
    name: String,
    config: RetryConfig,
    is_retryable: Option<RetryPredicate<E>>,
    on_retry: Option<RetryCallback<E>>,
    stats: Option<Arc<RetryStats>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            is_retryable: self.is_retryable.clone(),
            on_retry: self.on_retry.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("custom_predicate", &self.is_retryable.is_some())
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: ClassifyError + fmt::Display,
{
    pub fn new(config: RetryConfig) -> Self {
        Self {
            name: "operation".to_string(),
            config,
            is_retryable: None,
            on_retry: None,
            stats: None,
        }
    }

    /// Operation label used in log lines.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the kind-based classification entirely.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Some(Arc::new(predicate));
        self
    }

    /// Fires before every backoff sleep with (attempt, error, delay).
    pub fn on_retry<C>(mut self, callback: C) -> Self
    where
        C: Fn(u32, &E, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn with_stats(mut self, stats: Arc<RetryStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn stats(&self) -> Option<&Arc<RetryStats>> {
        self.stats.as_ref()
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        match &self.is_retryable {
            Some(predicate) => predicate(error),
            None => self.config.retryable_errors.contains(&error.kind()),
        }
    }

    /// Server-provided retry-after wins verbatim; otherwise the backoff formula.
    pub fn delay_for(&self, attempt: u32, error: &E) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| self.config.delay_for_attempt(attempt))
    }

    fn count(&self, pick: impl Fn(&RetryStats) -> &AtomicU64) {
        if let Some(stats) = &self.stats {
            pick(stats).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Invoke `operation` until it succeeds, fails non-retryably, or runs out
    /// of attempts. The final error is returned unchanged.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        self.count(|s| &s.calls);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.count(|s| &s.attempts);

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = %self.name,
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    self.count(|s| &s.successes);
                    return Ok(value);
                }
                Err(e) => {
                    if !self.is_retryable(&e) {
                        debug!(
                            operation = %self.name,
                            attempt = attempt,
                            kind = %e.kind(),
                            error = %e,
                            "Operation failed with non-retryable error"
                        );
                        self.count(|s| &s.failures);
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        warn!(
                            operation = %self.name,
                            attempt = attempt,
                            error = %e,
                            "Operation failed after all retries"
                        );
                        self.count(|s| &s.failures);
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        operation = %self.name,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    if let Some(callback) = &self.on_retry {
                        callback(attempt, &e, delay);
                    }
                    self.count(|s| &s.retries);

                    sleep(delay).await;
                }
            }
        }
    }
}

/// One-shot form of [`RetryPolicy::run`] with kind-based classification.
pub async fn run_with_retry<F, Fut, T, E>(operation: F, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyError + fmt::Display,
{
    RetryPolicy::new(config.clone()).run(operation).await
}
