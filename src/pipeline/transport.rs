//! Transport & Signing Seams
//! The pipeline talks to venues only through these traits

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;

use super::request::{ApiRequest, ApiResponse};
use crate::error::ExchangeError;

/// Performs one HTTP exchange. Dropping the returned future must abort the call.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError>;
}

/// Authentication strategy applied to each attempt before it is sent.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut ApiRequest) -> Result<(), ExchangeError>;
}

// =====================================================
// SIMULATED VENUE
// =====================================================

/// In-process venue with a configurable failure rate and latency.
#[derive(Debug, Clone)]
pub struct SimulatedVenue {
    pub exchange: String,
    pub failure_rate: f64,
    pub latency: Duration,
}

enum Outcome {
    Ok,
    Unavailable,
    Throttled,
    Dropped,
}

impl SimulatedVenue {
    pub fn new(exchange: impl Into<String>, failure_rate: f64, latency: Duration) -> Self {
        Self {
            exchange: exchange.into(),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
        }
    }

    fn roll(&self) -> Outcome {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() >= self.failure_rate {
            return Outcome::Ok;
        }
        match rng.gen_range(0..3) {
            0 => Outcome::Unavailable,
            1 => Outcome::Throttled,
            _ => Outcome::Dropped,
        }
    }
}

#[async_trait]
impl HttpTransport for SimulatedVenue {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        let outcome = self.roll();
        tokio::time::sleep(self.latency).await;

        match outcome {
            Outcome::Ok => {
                let body = json!({
                    "exchange": self.exchange,
                    "path": request.path,
                    "serverTime": Utc::now().timestamp_millis(),
                });
                Ok(ApiResponse::new(200, body.to_string()))
            }
            Outcome::Unavailable => Ok(ApiResponse::new(503, "service unavailable")),
            Outcome::Throttled => {
                Ok(ApiResponse::new(429, "too many requests").with_header("Retry-After", "1"))
            }
            Outcome::Dropped => Err(ExchangeError::Network("connection reset by peer".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn healthy_venue_always_succeeds() {
        let venue = SimulatedVenue::new("sim", 0.0, Duration::from_millis(5));
        for _ in 0..20 {
            let resp = venue.send(&ApiRequest::get("/api/v3/time")).await.unwrap();
            assert_eq!(resp.status, 200);
            let body: serde_json::Value = resp.json().unwrap();
            assert_eq!(body["path"], "/api/v3/time");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_venue_never_succeeds() {
        let venue = SimulatedVenue::new("sim", 1.0, Duration::ZERO);
        for _ in 0..20 {
            match venue.send(&ApiRequest::get("/api/v3/time")).await {
                Ok(resp) => assert!(!resp.is_success()),
                Err(e) => assert!(matches!(e, ExchangeError::Network(_))),
            }
        }
    }
}
