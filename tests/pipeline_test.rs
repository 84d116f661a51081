//! Request Pipeline Tests
//! End-to-end behaviour over a scripted venue transport

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use venue_resilience::pipeline::{
    ApiRequest, ApiResponse, PipelineConfig, RequestPipeline, CORRELATION_HEADER,
};
use venue_resilience::resilience::{CircuitState, RateLimiterConfig};
use venue_resilience::{ErrorKind, ExchangeError};

use common::{hair_trigger_breaker, network_error, pipeline_config, ScriptedTransport, StaticKeySigner, Step};

fn pipeline(config: PipelineConfig, transport: &Arc<ScriptedTransport>) -> RequestPipeline {
    RequestPipeline::new(config, transport.clone()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_success_stamps_correlation_id_and_records_metrics() {
        let transport = ScriptedTransport::new([Step::ok(r#"{"price":"42000.5"}"#)]);
        let pipeline = pipeline(pipeline_config(3), &transport);

        let response = pipeline
            .request(ApiRequest::get("/api/v3/ticker/price").query("symbol", "BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let id = sent[0].header_value(CORRELATION_HEADER).unwrap();
        assert!(!id.is_empty());

        let snapshot = pipeline.metrics_snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.success_rate, 100.0);
        assert_eq!(snapshot.endpoints[0].endpoint, "GET /api/v3/ticker/price");
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_is_retried_with_same_correlation_id() {
        let transport = ScriptedTransport::new([Step::status(503), Step::status(502), Step::ok("{}")]);
        let pipeline = pipeline(pipeline_config(3), &transport);

        let started = Instant::now();
        pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap();

        assert_eq!(transport.calls(), 3);
        // 100ms then 200ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let ids: Vec<String> = transport
            .sent()
            .iter()
            .map(|r| r.header_value(CORRELATION_HEADER).unwrap().to_string())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let snapshot = pipeline.metrics_snapshot();
        assert_eq!(snapshot.endpoints[0].count, 3);
        assert_eq!(snapshot.failed_requests, 2);
        assert_eq!(pipeline.circuit_breaker().metrics().total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_first_attempt() {
        let transport = ScriptedTransport::new([Step::Respond(ApiResponse::new(400, "bad symbol"))]);
        let pipeline = pipeline(pipeline_config(3), &transport);

        let err = pipeline
            .request(ApiRequest::get("/api/v3/ticker/price"))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(
            err.source,
            ExchangeError::Http {
                status: 400,
                body: "bad symbol".into()
            }
        );
        let sent_id = transport.sent()[0].header_value(CORRELATION_HEADER).unwrap().to_string();
        assert_eq!(err.correlation_id, sent_id);
        assert!(err.to_string().contains(&sent_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_surface_last_error() {
        let transport = ScriptedTransport::new([
            Step::Fail(network_error()),
            Step::Fail(network_error()),
            Step::status(504),
        ]);
        let pipeline = pipeline(pipeline_config(3), &transport);

        let err = pipeline.request(ApiRequest::get("/api/v3/depth")).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.kind(), ErrorKind::ExchangeUnavailable);
        assert_eq!(err.endpoint, "GET /api/v3/depth");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_header_is_honoured() {
        let throttled = ApiResponse::new(429, "too many requests").with_header("Retry-After", "0.2");
        let transport = ScriptedTransport::new([Step::Respond(throttled)]);
        let mut config = pipeline_config(2);
        config.retry.base_delay = Duration::from_secs(5);
        let pipeline = pipeline(config, &transport);

        let started = Instant::now();
        pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_retry_after_falls_back_to_backoff() {
        let throttled = ApiResponse::new(429, "slow down").with_header("Retry-After", "1e30");
        let transport = ScriptedTransport::new([Step::Respond(throttled)]);
        let pipeline = pipeline(pipeline_config(2), &transport);

        let started = Instant::now();
        pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_and_releases_tokens() {
        let transport = ScriptedTransport::new([Step::Hang, Step::Hang]);
        let pipeline = pipeline(pipeline_config(2), &transport);

        let started = Instant::now();
        let err = pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.source, ExchangeError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::Network);
        // Two 1s timeouts plus one 100ms backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(2100));
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_transport() {
        let transport = ScriptedTransport::new([Step::status(500)]);
        let config = PipelineConfig {
            circuit_breaker: hair_trigger_breaker("test-venue"),
            ..pipeline_config(1)
        };
        let pipeline = pipeline(config, &transport);

        assert!(pipeline.request(ApiRequest::get("/api/v3/time")).await.is_err());
        assert_eq!(pipeline.circuit_breaker().state(), CircuitState::Open);

        let err = pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap_err();
        assert_eq!(transport.calls(), 1);
        assert_eq!(err.attempts, 0);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paid_once_per_logical_call() {
        let transport = ScriptedTransport::new([Step::status(503), Step::status(503)]);
        let config = PipelineConfig {
            rate_limit: Some(RateLimiterConfig {
                max_tokens: 10,
                window: Duration::from_secs(60),
                refill_rate: 10,
                ..Default::default()
            }),
            ..pipeline_config(3)
        };
        let pipeline = pipeline(config, &transport);

        pipeline
            .request(ApiRequest::get("/api/v3/depth").weight(4))
            .await
            .unwrap();
        assert_eq!(transport.calls(), 3);
        assert_eq!(pipeline.rate_limiter().unwrap().available_tokens(), 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_weight_never_reaches_transport() {
        let transport = ScriptedTransport::new([]);
        let config = PipelineConfig {
            rate_limit: Some(RateLimiterConfig::default()),
            ..pipeline_config(3)
        };
        let pipeline = pipeline(config, &transport);

        let err = pipeline
            .request(ApiRequest::get("/api/v3/allOrders").weight(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.attempts, 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_requests_use_signer() {
        let transport = ScriptedTransport::new([]);
        let pipeline = pipeline(pipeline_config(1), &transport).with_signer(Arc::new(StaticKeySigner("key-1")));

        pipeline
            .request(ApiRequest::post("/api/v3/order").json(serde_json::json!({"side": "BUY"})).signed())
            .await
            .unwrap();
        pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].header_value("X-API-KEY"), Some("key-1"));
        assert_eq!(sent[1].header_value("X-API-KEY"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_request_without_signer_is_rejected() {
        let transport = ScriptedTransport::new([]);
        let pipeline = pipeline(pipeline_config(3), &transport);

        let err = pipeline
            .request(ApiRequest::post("/api/v3/order").signed())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_correlation_id_is_kept() {
        let transport = ScriptedTransport::new([Step::status(404)]);
        let pipeline = pipeline(pipeline_config(1), &transport);

        let err = pipeline
            .request(ApiRequest::get("/api/v3/unknown").header(CORRELATION_HEADER, "trace-abc"))
            .await
            .unwrap_err();
        assert_eq!(err.correlation_id, "trace-abc");
        assert_eq!(transport.sent()[0].header_value(CORRELATION_HEADER), Some("trace-abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_json_decodes_body() {
        #[derive(Debug, Deserialize)]
        struct Ticker {
            symbol: String,
            price: String,
        }

        let transport = ScriptedTransport::new([
            Step::ok(r#"{"symbol":"BTCUSDT","price":"42000.5"}"#),
            Step::ok("not json"),
        ]);
        let pipeline = pipeline(pipeline_config(1), &transport);

        let ticker: Ticker = pipeline
            .request_json(ApiRequest::get("/api/v3/ticker/price"))
            .await
            .unwrap();
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.price, "42000.5");

        let err = pipeline
            .request_json::<Ticker>(ApiRequest::get("/api/v3/ticker/price"))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ExchangeError::Decode(_)));
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_attempts() {
        let transport = ScriptedTransport::new([Step::Hang]);
        let config = PipelineConfig {
            timeout: Duration::from_secs(60),
            ..pipeline_config(3)
        };
        let pipeline = Arc::new(pipeline(config, &transport));

        let pending = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.request(ApiRequest::get("/api/v3/time")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pipeline.in_flight(), 1);

        pipeline.disconnect();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.source, ExchangeError::Cancelled);
        assert_eq!(err.attempts, 1);
        assert_eq!(pipeline.in_flight(), 0);
        assert!(!pipeline.is_connected());

        let err = pipeline.request(ApiRequest::get("/api/v3/time")).await.unwrap_err();
        assert_eq!(err.source, ExchangeError::Cancelled);
        assert!(pipeline.circuit_breaker().is_shut_down());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let transport = ScriptedTransport::new([]);
        let config = PipelineConfig {
            timeout: Duration::ZERO,
            ..pipeline_config(1)
        };
        let err = RequestPipeline::new(config, transport).unwrap_err();
        assert!(matches!(err, ExchangeError::Configuration(_)));
    }
}
