//! Per-Endpoint Request Metrics
//! In-memory latency and error accounting owned by one pipeline

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStats {
    pub count: u64,
    pub total_latency: Duration,
    pub errors: u64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub last_request_at: DateTime<Utc>,
}

impl EndpointStats {
    fn first(latency: Duration, failed: bool) -> Self {
        Self {
            count: 1,
            total_latency: latency,
            errors: u64::from(failed),
            min_latency: latency,
            max_latency: latency,
            last_request_at: Utc::now(),
        }
    }

    fn record(&mut self, latency: Duration, failed: bool) {
        self.count += 1;
        self.total_latency += latency;
        if failed {
            self.errors += 1;
        }
        self.min_latency = self.min_latency.min(latency);
        self.max_latency = self.max_latency.max(latency);
        self.last_request_at = Utc::now();
    }

    pub fn average_latency(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_latency.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Percentage of attempts that failed.
    pub fn error_rate(&self) -> f64 {
        percent(self.errors, self.count)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub count: u64,
    pub average_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub error_rate: f64,
    pub last_request_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Sorted by descending request count.
    pub endpoints: Vec<EndpointSnapshot>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub collection_duration_ms: u64,
}

#[derive(Debug)]
pub struct PipelineMetrics {
    endpoints: HashMap<String, EndpointStats>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            started_at: Instant::now(),
        }
    }
}

impl PipelineMetrics {
    /// Record one attempt against `endpoint`.
    pub fn record(&mut self, endpoint: &str, latency: Duration, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        match self.endpoints.get_mut(endpoint) {
            Some(stats) => stats.record(latency, !success),
            None => {
                self.endpoints
                    .insert(endpoint.to_string(), EndpointStats::first(latency, !success));
            }
        }
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointStats> {
        self.endpoints.get(endpoint)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut endpoints: Vec<EndpointSnapshot> = self
            .endpoints
            .iter()
            .map(|(endpoint, stats)| EndpointSnapshot {
                endpoint: endpoint.clone(),
                count: stats.count,
                average_latency_ms: millis(stats.average_latency()),
                min_latency_ms: millis(stats.min_latency),
                max_latency_ms: millis(stats.max_latency),
                error_rate: stats.error_rate(),
                last_request_at: stats.last_request_at,
            })
            .collect();
        endpoints.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)));

        MetricsSnapshot {
            endpoints,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: percent(self.successful_requests, self.total_requests),
            error_rate: percent(self.failed_requests, self.total_requests),
            collection_duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}
