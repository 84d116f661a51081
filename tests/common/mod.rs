//! Shared Test Helpers
//! Scripted venue transport and small fixtures for the integration suites

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use venue_resilience::pipeline::{
    ApiRequest, ApiResponse, HttpTransport, PipelineConfig, RequestSigner,
};
use venue_resilience::resilience::{CircuitBreakerConfig, RetryConfig};
use venue_resilience::ExchangeError;

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(ApiResponse),
    Fail(ExchangeError),
    /// Never completes; only a timeout or cancellation ends the attempt.
    Hang,
}

impl Step {
    pub fn ok(body: &str) -> Self {
        Step::Respond(ApiResponse::new(200, body))
    }

    pub fn status(status: u16) -> Self {
        Step::Respond(ApiResponse::new(status, format!("status {}", status)))
    }
}

/// Plays back `steps` in order, then answers `200 {}` forever.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<ApiRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ApiRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();

        match step {
            None => Ok(ApiResponse::new(200, "{}")),
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => std::future::pending().await,
        }
    }
}

/// Adds a fixed API key header, mimicking a venue key signer.
pub struct StaticKeySigner(pub &'static str);

impl RequestSigner for StaticKeySigner {
    fn sign(&self, request: &mut ApiRequest) -> Result<(), ExchangeError> {
        request.set_header("X-API-KEY", self.0);
        Ok(())
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        enable_jitter: false,
        ..Default::default()
    }
}

/// Breaker that trips on the first failure.
pub fn hair_trigger_breaker(name: &str) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 1,
        minimum_request_volume: 1,
        reset_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::named(name)
    }
}

pub fn pipeline_config(max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        timeout: Duration::from_secs(1),
        retry: fast_retry(max_attempts),
        ..PipelineConfig::new("test-venue")
    }
}

pub fn network_error() -> ExchangeError {
    ExchangeError::Network("connection reset".into())
}
