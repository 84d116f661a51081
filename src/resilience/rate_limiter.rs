//! Token Bucket Rate Limiter
//! Weighted, strictly FIFO admission control for outbound venue calls
//!
//! Tokens refill lazily on every access in whole windows only, so partial
//! windows never drift the refill clock. Waiters queue on a fair async mutex:
//! the holder is the head of the queue and the only one polling the bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::lock;
use crate::error::ExchangeError;

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Label used in logs only.
    pub exchange: String,
    pub max_tokens: u32,
    #[serde(rename = "window_ms", with = "crate::serde_millis")]
    pub window: Duration,
    /// Tokens restored per elapsed window.
    pub refill_rate: u32,
    /// Per-endpoint cost table, keyed by endpoint path.
    pub weights: HashMap<String, u32>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            exchange: "default".to_string(),
            max_tokens: 10,
            window: Duration::from_millis(1000),
            refill_rate: 10,
            weights: HashMap::new(),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_weight(mut self, endpoint: impl Into<String>, weight: u32) -> Self {
        self.weights.insert(endpoint.into(), weight);
        self
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.max_tokens == 0 {
            return Err(ExchangeError::Configuration("max_tokens must be positive".into()));
        }
        if self.window.is_zero() {
            return Err(ExchangeError::Configuration("window must be positive".into()));
        }
        if self.refill_rate == 0 {
            return Err(ExchangeError::Configuration("refill_rate must be positive".into()));
        }
        if let Some((endpoint, weight)) = self.weights.iter().find(|(_, w)| **w > self.max_tokens) {
            return Err(ExchangeError::Configuration(format!(
                "weight {} for '{}' exceeds max_tokens {}; it could never be admitted",
                weight, endpoint, self.max_tokens
            )));
        }
        Ok(())
    }

    /// Explicit weight, else the endpoint's table entry, else 1.
    pub fn resolve_weight(&self, endpoint: Option<&str>, weight: Option<u32>) -> u32 {
        weight
            .or_else(|| endpoint.and_then(|e| self.weights.get(e).copied()))
            .unwrap_or(1)
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: config.max_tokens as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant, config: &RateLimiterConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let windows = (elapsed.as_nanos() / config.window.as_nanos()).min(u32::MAX as u128) as u32;
        if windows == 0 {
            return;
        }

        let restored = windows as f64 * config.refill_rate as f64;
        self.tokens = (self.tokens + restored).min(config.max_tokens as f64);
        self.last_refill += config.window * windows;
    }

    fn time_until_refill(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.last_refill))
    }
}

/// Counts a caller as pending until it is granted or abandons the wait.
struct PendingSlot<'a>(&'a AtomicUsize);

impl<'a> PendingSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<TokenBucket>,
    /// Fair (FIFO) async mutex; holding it means being at the head of the queue.
    admission: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ExchangeError> {
        config.validate()?;
        Ok(Self {
            bucket: Mutex::new(TokenBucket::full(&config)),
            config,
            admission: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn check_capacity(&self, weight: u32) -> Result<(), ExchangeError> {
        if weight > self.config.max_tokens {
            return Err(ExchangeError::WeightExceedsCapacity {
                weight,
                max_tokens: self.config.max_tokens,
            });
        }
        Ok(())
    }

    /// Wait in arrival order until `weight` tokens are available, then take
    /// them. Returns how long the caller waited.
    pub async fn acquire(
        &self,
        endpoint: Option<&str>,
        weight: Option<u32>,
    ) -> Result<Duration, ExchangeError> {
        let weight = self.config.resolve_weight(endpoint, weight);
        self.check_capacity(weight)?;

        let started = Instant::now();
        let _pending = PendingSlot::enter(&self.pending);
        let _turn = self.admission.lock().await;

        loop {
            let wait = {
                let now = Instant::now();
                let mut bucket = lock(&self.bucket);
                bucket.refill(now, &self.config);
                if bucket.tokens >= weight as f64 {
                    bucket.tokens -= weight as f64;
                    None
                } else {
                    // Non-zero: refill() leaves less than one window elapsed.
                    Some(
                        bucket
                            .time_until_refill(now, self.config.window)
                            .min(MAX_POLL_INTERVAL),
                    )
                }
            };

            match wait {
                None => break,
                Some(delay) => sleep(delay).await,
            }
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            debug!(
                exchange = %self.config.exchange,
                endpoint = endpoint.unwrap_or("-"),
                weight = weight,
                waited_ms = waited.as_millis() as u64,
                "Rate limiter admitted after wait"
            );
        }
        Ok(waited)
    }

    /// Take tokens only if that needs no waiting and nobody is queued ahead.
    pub fn try_acquire(&self, endpoint: Option<&str>, weight: Option<u32>) -> bool {
        let weight = self.config.resolve_weight(endpoint, weight);
        if weight > self.config.max_tokens {
            return false;
        }
        let Ok(_turn) = self.admission.try_lock() else {
            return false;
        };

        let mut bucket = lock(&self.bucket);
        bucket.refill(Instant::now(), &self.config);
        if bucket.tokens >= weight as f64 {
            bucket.tokens -= weight as f64;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = lock(&self.bucket);
        bucket.refill(Instant::now(), &self.config);
        bucket.tokens
    }

    pub fn time_until_refill(&self) -> Duration {
        let now = Instant::now();
        let mut bucket = lock(&self.bucket);
        bucket.refill(now, &self.config);
        bucket.time_until_refill(now, self.config.window)
    }

    /// Callers inside `acquire` that have not been granted yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Refill to full and restart the refill clock. Queued callers keep
    /// their place and are served from the refilled bucket.
    pub fn reset(&self) {
        *lock(&self.bucket) = TokenBucket::full(&self.config);
        info!(
            exchange = %self.config.exchange,
            pending = self.pending(),
            "Rate limiter reset"
        );
    }
}
