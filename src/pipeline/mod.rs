//! Request Pipeline
//! Per-adapter entry point: rate limiting → circuit breaker → timed, retried attempts
//!
//! Every logical call gets a correlation id that is stamped on each outbound
//! attempt, on the tracing span, and on any error leaving the pipeline.

mod correlation;
mod metrics;
mod request;
mod transport;

pub use correlation::CorrelationId;
pub use metrics::{EndpointSnapshot, EndpointStats, MetricsSnapshot, PipelineMetrics};
pub use request::{ApiRequest, ApiResponse, Method, CORRELATION_HEADER};
pub use transport::{HttpTransport, RequestSigner, SimulatedVenue};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ClassifyError, ErrorKind, ExchangeError, RequestError};
use crate::observability::metrics::{
    observe_rate_limit_wait, record_request, record_retry, PrometheusObserver,
};
use crate::resilience::{
    lock, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, RetryConfig,
    RetryPolicy,
};

/// Statuses retried by default: timeout, throttling and transient server errors.
pub const DEFAULT_RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub exchange: String,
    /// Upper bound on a single attempt.
    #[serde(rename = "timeout_ms", with = "crate::serde_millis")]
    pub timeout: Duration,
    /// `max_attempts` counts the first attempt.
    pub retry: RetryConfig,
    pub retry_statuses: Vec<u16>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: Option<RateLimiterConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl PipelineConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            circuit_breaker: CircuitBreakerConfig::named(exchange.clone()),
            exchange,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            rate_limit: None,
        }
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.timeout.is_zero() {
            return Err(ExchangeError::Configuration("request timeout must be positive".into()));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

// =====================================================
// ATTEMPT BOOKKEEPING
// =====================================================

/// Registration of one outbound attempt; removed from the map on drop.
struct InFlightAttempt<'a> {
    registry: &'a Mutex<HashMap<u64, CancellationToken>>,
    id: u64,
    token: CancellationToken,
}

impl Drop for InFlightAttempt<'_> {
    fn drop(&mut self) {
        lock(self.registry).remove(&self.id);
    }
}

struct AttemptFailure {
    error: ExchangeError,
    retryable: bool,
}

impl AttemptFailure {
    fn fatal(error: ExchangeError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

// =====================================================
// REQUEST PIPELINE
// =====================================================

pub struct RequestPipeline {
    config: PipelineConfig,
    transport: Arc<dyn HttpTransport>,
    signer: Option<Arc<dyn RequestSigner>>,
    rate_limiter: Option<RateLimiter>,
    breaker: CircuitBreaker,
    backoff: RetryPolicy<ExchangeError>,
    metrics: Mutex<PipelineMetrics>,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
    next_attempt_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RequestPipeline {
    pub fn new(config: PipelineConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, ExchangeError> {
        config.validate()?;

        let rate_limiter = config.rate_limit.clone().map(RateLimiter::new).transpose()?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone())?;
        PrometheusObserver::attach(&breaker);
        let backoff = RetryPolicy::new(config.retry.clone()).named(config.exchange.clone());

        info!(
            exchange = %config.exchange,
            timeout_ms = config.timeout.as_millis() as u64,
            max_attempts = config.retry.max_attempts,
            rate_limited = rate_limiter.is_some(),
            "Request pipeline created"
        );

        Ok(Self {
            config,
            transport,
            signer: None,
            rate_limiter,
            breaker,
            backoff,
            metrics: Mutex::new(PipelineMetrics::default()),
            in_flight: Mutex::new(HashMap::new()),
            next_attempt_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Attempts currently on the wire.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        lock(&self.metrics).snapshot()
    }

    pub fn reset_metrics(&self) {
        lock(&self.metrics).reset();
    }

    /// Cancel every in-flight attempt, limiter wait and backoff sleep, and
    /// shut the breaker down. Later calls fail with `Cancelled`.
    pub fn disconnect(&self) {
        let in_flight = {
            let attempts = lock(&self.in_flight);
            for token in attempts.values() {
                token.cancel();
            }
            attempts.len()
        };
        self.shutdown.cancel();
        self.breaker.shutdown();
        info!(exchange = %self.config.exchange, in_flight = in_flight, "Request pipeline disconnected");
    }

    /// Send `request` through the full resilience stack. A caller-supplied
    /// `X-Correlation-Id` header is kept; otherwise a fresh id is minted.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        self.dispatch(request).await.map(|(response, _, _)| response)
    }

    /// As [`request`](Self::request), decoding the successful body as JSON.
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, RequestError> {
        let endpoint = request.endpoint_key();
        let (response, correlation_id, attempts) = self.dispatch(request).await?;
        response.json().map_err(|source| RequestError {
            correlation_id: correlation_id.to_string(),
            endpoint,
            attempts,
            source,
        })
    }

    async fn dispatch(
        &self,
        request: ApiRequest,
    ) -> Result<(ApiResponse, CorrelationId, u32), RequestError> {
        let correlation_id = request
            .header_value(CORRELATION_HEADER)
            .map(|id| CorrelationId::from(id.to_string()))
            .unwrap_or_default();
        let endpoint = request.endpoint_key();
        let span = info_span!(
            "venue_request",
            correlation_id = %correlation_id,
            exchange = %self.config.exchange,
            endpoint = %endpoint,
        );

        let mut attempts = 0;
        let outcome = self
            .call(&request, &correlation_id, &endpoint, &mut attempts)
            .instrument(span)
            .await;

        match outcome {
            Ok(response) => Ok((response, correlation_id, attempts)),
            Err(source) => Err(RequestError {
                correlation_id: correlation_id.to_string(),
                endpoint,
                attempts,
                source,
            }),
        }
    }

    async fn call(
        &self,
        request: &ApiRequest,
        correlation_id: &CorrelationId,
        endpoint: &str,
        attempts: &mut u32,
    ) -> Result<ApiResponse, ExchangeError> {
        if self.shutdown.is_cancelled() {
            return Err(ExchangeError::Cancelled);
        }

        // Tokens are paid once per logical call, not per attempt.
        if let Some(limiter) = &self.rate_limiter {
            let waited = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ExchangeError::Cancelled),
                waited = limiter.acquire(Some(&request.path), request.weight) => waited?,
            };
            observe_rate_limit_wait(&self.config.exchange, waited);
        }

        self.breaker
            .execute(move || self.run_attempts(request, correlation_id, endpoint, attempts))
            .await
    }

    async fn run_attempts(
        &self,
        request: &ApiRequest,
        correlation_id: &CorrelationId,
        endpoint: &str,
        attempts: &mut u32,
    ) -> Result<ApiResponse, ExchangeError> {
        let max_attempts = self.config.retry.max_attempts.max(1);

        loop {
            *attempts += 1;
            let attempt = *attempts;

            let failure = match self.attempt(request, correlation_id, endpoint).await {
                Ok(response) => {
                    if attempt > 1 {
                        record_retry(endpoint, "success");
                        debug!(attempt = attempt, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            if !failure.retryable {
                debug!(
                    attempt = attempt,
                    kind = %failure.error.kind(),
                    error = %failure.error,
                    "Request failed with non-retryable error"
                );
                return Err(failure.error);
            }
            if attempt >= max_attempts {
                warn!(
                    attempt = attempt,
                    error = %failure.error,
                    "Request failed after all retries"
                );
                record_retry(endpoint, "exhausted");
                return Err(failure.error);
            }

            let delay = self.backoff.delay_for(attempt, &failure.error);
            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                error = %failure.error,
                delay_ms = delay.as_millis() as u64,
                "Request failed, retrying"
            );
            record_retry(endpoint, "retry");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ExchangeError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    fn register_attempt(&self) -> InFlightAttempt<'_> {
        let id = self.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        lock(&self.in_flight).insert(id, token.clone());
        InFlightAttempt {
            registry: &self.in_flight,
            id,
            token,
        }
    }

    fn sign(&self, request: &mut ApiRequest) -> Result<(), ExchangeError> {
        match &self.signer {
            Some(signer) => signer.sign(request),
            None => Err(ExchangeError::Configuration(format!(
                "{} requires signing but no signer is configured",
                request.endpoint_key()
            ))),
        }
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        correlation_id: &CorrelationId,
        endpoint: &str,
    ) -> Result<ApiResponse, AttemptFailure> {
        let mut outbound = request.clone();
        outbound.set_header(CORRELATION_HEADER, correlation_id.as_str());
        if outbound.signed {
            self.sign(&mut outbound).map_err(AttemptFailure::fatal)?;
        }

        let started = Instant::now();
        let sent = {
            let in_flight = self.register_attempt();
            tokio::select! {
                _ = in_flight.token.cancelled() => Err(ExchangeError::Cancelled),
                sent = timeout(self.config.timeout, self.transport.send(&outbound)) => {
                    sent.unwrap_or_else(|_| Err(ExchangeError::Timeout(self.config.timeout)))
                }
            }
        };
        let latency = started.elapsed();

        let result = match sent {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => {
                let retryable = self.config.retry_statuses.contains(&response.status);
                let retry_after = response.retry_after();
                Err(AttemptFailure {
                    error: ExchangeError::from_status(response.status, response.body, retry_after),
                    retryable,
                })
            }
            Err(error) => {
                let retryable = error.kind() == ErrorKind::Network;
                Err(AttemptFailure { error, retryable })
            }
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(failure) => failure.error.kind().as_str(),
        };
        lock(&self.metrics).record(endpoint, latency, result.is_ok());
        record_request(&self.config.exchange, endpoint, outcome, latency);

        result
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("exchange", &self.config.exchange)
            .field("breaker", &self.breaker)
            .field("connected", &self.is_connected())
            .finish()
    }
}
