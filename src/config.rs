//! Configuration Module
//! Loads gateway settings from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::PipelineConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub metrics_port: u16,
    pub simulated_failure_rate: f64,
    pub simulated_latency: Duration,
    pub load_interval: Duration,
}

/// Parsed value of `key`, or `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let exchange = env::var("EXCHANGE").unwrap_or_else(|_| "simulated".to_string());

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            // MAX_RETRIES counts retries after the first attempt.
            max_attempts: env_or("MAX_RETRIES", retry_defaults.max_attempts.saturating_sub(1))
                .saturating_add(1),
            base_delay: env_millis("RETRY_BASE_DELAY_MS", retry_defaults.base_delay),
            max_delay: env_millis("RETRY_MAX_DELAY_MS", retry_defaults.max_delay),
            ..retry_defaults
        };

        let limiter_defaults = RateLimiterConfig::default();
        let rate_limit = RateLimiterConfig {
            exchange: exchange.clone(),
            max_tokens: env_or("RATE_LIMIT_MAX_TOKENS", limiter_defaults.max_tokens),
            window: env_millis("RATE_LIMIT_WINDOW_MS", limiter_defaults.window),
            refill_rate: env_or("RATE_LIMIT_REFILL_RATE", limiter_defaults.refill_rate),
            ..limiter_defaults
        };

        let breaker_defaults = CircuitBreakerConfig::named(exchange.clone());
        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", breaker_defaults.failure_threshold),
            success_threshold: env_or("BREAKER_SUCCESS_THRESHOLD", breaker_defaults.success_threshold),
            reset_timeout: env_millis("BREAKER_RESET_TIMEOUT_MS", breaker_defaults.reset_timeout),
            time_window: env_millis("BREAKER_TIME_WINDOW_MS", breaker_defaults.time_window),
            minimum_request_volume: env_or(
                "BREAKER_MINIMUM_REQUEST_VOLUME",
                breaker_defaults.minimum_request_volume,
            ),
            error_threshold_percentage: env_or(
                "BREAKER_ERROR_THRESHOLD_PERCENTAGE",
                breaker_defaults.error_threshold_percentage,
            ),
            ..breaker_defaults
        };

        let pipeline = PipelineConfig {
            timeout: env_millis("REQUEST_TIMEOUT_MS", Duration::from_secs(30)),
            retry,
            circuit_breaker,
            rate_limit: Some(rate_limit),
            ..PipelineConfig::new(exchange)
        };
        pipeline.validate()?;

        Ok(Self {
            pipeline,
            metrics_port: env_or("METRICS_PORT", 9100),
            simulated_failure_rate: env_or("SIMULATED_FAILURE_RATE", 0.1),
            simulated_latency: env_millis("SIMULATED_LATENCY_MS", Duration::from_millis(50)),
            load_interval: env_millis("LOAD_INTERVAL_MS", Duration::from_millis(250)),
        })
    }
}
