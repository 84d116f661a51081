//! Prometheus Metrics for Venue Calls
//! Request outcomes, latencies, breaker state, retries and limiter waits

use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::resilience::{lock, BreakerEvent, BreakerObserver, CircuitBreaker, CircuitState};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub struct Metrics {
    pub requests_total: CounterVec,
    pub request_duration: HistogramVec,
    pub circuit_breaker_state: GaugeVec,
    pub retry_attempts_total: CounterVec,
    pub rate_limiter_wait: HistogramVec,
}

static METRICS: Lazy<Mutex<Option<Metrics>>> = Lazy::new(|| Mutex::new(None));

/// Register the metric families. Later calls are no-ops.
pub fn init_metrics(service_name: &str) -> anyhow::Result<()> {
    let mut guard = lock(&METRICS);
    if guard.is_some() {
        return Ok(());
    }

    let requests_total = CounterVec::new(
        Opts::new("venue_requests_total", "Outbound venue request attempts")
            .const_label("service", service_name),
        &["exchange", "endpoint", "outcome"],
    )?;

    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "venue_request_duration_seconds",
            "Venue request attempt latency in seconds",
        )
        .const_label("service", service_name)
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["exchange", "endpoint"],
    )?;

    let circuit_breaker_state = GaugeVec::new(
        Opts::new(
            "venue_circuit_breaker_state",
            "Circuit breaker state (0=closed, 0.5=half-open, 1=open)",
        )
        .const_label("service", service_name),
        &["name"],
    )?;

    let retry_attempts_total = CounterVec::new(
        Opts::new("venue_retry_attempts_total", "Retry decisions by outcome")
            .const_label("service", service_name),
        &["operation", "outcome"],
    )?;

    let rate_limiter_wait = HistogramVec::new(
        HistogramOpts::new(
            "venue_rate_limiter_wait_seconds",
            "Time spent queued for rate limit tokens",
        )
        .const_label("service", service_name)
        .buckets(vec![0.0, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["exchange"],
    )?;

    REGISTRY.register(Box::new(requests_total.clone()))?;
    REGISTRY.register(Box::new(request_duration.clone()))?;
    REGISTRY.register(Box::new(circuit_breaker_state.clone()))?;
    REGISTRY.register(Box::new(retry_attempts_total.clone()))?;
    REGISTRY.register(Box::new(rate_limiter_wait.clone()))?;

    *guard = Some(Metrics {
        requests_total,
        request_duration,
        circuit_breaker_state,
        retry_attempts_total,
        rate_limiter_wait,
    });

    tracing::info!(service = service_name, "Prometheus metrics initialized");
    Ok(())
}

pub fn get_metrics() -> MutexGuard<'static, Option<Metrics>> {
    lock(&METRICS)
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

// =====================================================
// RECORDING HELPERS (no-ops until initialized)
// =====================================================

pub fn record_request(exchange: &str, endpoint: &str, outcome: &str, latency: Duration) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .requests_total
            .with_label_values(&[exchange, endpoint, outcome])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[exchange, endpoint])
            .observe(latency.as_secs_f64());
    }
}

pub fn record_retry(operation: &str, outcome: &str) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

pub fn observe_rate_limit_wait(exchange: &str, waited: Duration) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .rate_limiter_wait
            .with_label_values(&[exchange])
            .observe(waited.as_secs_f64());
    }
}

pub fn set_breaker_state(name: &str, state: CircuitState) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .circuit_breaker_state
            .with_label_values(&[name])
            .set(state.as_metric_value());
    }
}

/// Mirrors breaker transitions into `venue_circuit_breaker_state`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusObserver;

impl PrometheusObserver {
    /// Subscribe to `breaker` and publish its current state.
    pub fn attach(breaker: &CircuitBreaker) {
        set_breaker_state(breaker.name(), breaker.state());
        breaker.subscribe(std::sync::Arc::new(PrometheusObserver));
    }
}

impl BreakerObserver for PrometheusObserver {
    fn on_event(&self, breaker: &str, event: &BreakerEvent) {
        if let BreakerEvent::StateChange { to, .. } = event {
            set_breaker_state(breaker, *to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;

    #[test]
    fn init_is_idempotent_and_exports_families() {
        init_metrics("venue-resilience-test").unwrap();
        init_metrics("venue-resilience-test").unwrap();

        record_request("binance", "GET /api/v3/time", "success", Duration::from_millis(12));
        record_retry("GET /api/v3/time", "retry");
        observe_rate_limit_wait("binance", Duration::from_millis(40));

        let text = encode_metrics();
        assert!(text.contains("venue_requests_total"));
        assert!(text.contains("venue_retry_attempts_total"));
        assert!(text.contains("venue_rate_limiter_wait_seconds"));
    }

    #[test]
    fn observer_tracks_breaker_state() {
        init_metrics("venue-resilience-test").unwrap();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::named("gauge-test")).unwrap();
        PrometheusObserver::attach(&breaker);

        PrometheusObserver.on_event(
            "gauge-test",
            &BreakerEvent::StateChange {
                from: CircuitState::Closed,
                to: CircuitState::Open,
            },
        );
        let value = get_metrics()
            .as_ref()
            .map(|m| m.circuit_breaker_state.with_label_values(&["gauge-test"]).get());
        assert_eq!(value, Some(1.0));
    }
}
