//! Circuit Breaker Implementation
//! Prevents cascading failures by failing fast when a venue is unhealthy
//!
//! ```text
//! Closed   → Open:     window volume >= minimum AND (failures >= threshold OR error % >= limit)
//! Open     → HalfOpen: reset_timeout elapsed (lazy check on execute, or the scheduled timer)
//! HalfOpen → Closed:   success_threshold consecutive successes
//! HalfOpen → Open:     any failure
//! ```
//!
//! Every transition starts the new state with an empty outcome window.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{lock, read, write};
use crate::error::{CircuitOpenError, ExchangeError, RejectReason};

/// Upper bound on window records, independent of the time cutoff.
const MAX_WINDOW_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0=closed, 0.5=half-open, 1=open.
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Failures counted since the last success that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
    #[serde(with = "crate::serde_millis")]
    pub time_window: Duration,
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
    /// Window volume required before any threshold is evaluated.
    pub minimum_request_volume: u32,
    pub error_threshold_percentage: f64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            time_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            minimum_request_volume: 10,
            error_threshold_percentage: 50.0,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ExchangeError::Configuration(
                "circuit breaker thresholds must be positive".into(),
            ));
        }
        if self.time_window.is_zero() {
            return Err(ExchangeError::Configuration(
                "circuit breaker time_window must be positive".into(),
            ));
        }
        if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
            return Err(ExchangeError::Configuration(format!(
                "error_threshold_percentage must be in (0, 100], got {}",
                self.error_threshold_percentage
            )));
        }
        if self.half_open_max_calls == 0 {
            return Err(ExchangeError::Configuration(
                "half_open_max_calls must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =====================================================
// EVENTS & OBSERVERS
// =====================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    Open,
    HalfOpen,
    Close,
    Success { latency: Duration },
    Failure { error: String, latency: Duration },
    Reject { reason: RejectReason },
    StateChange { from: CircuitState, to: CircuitState },
}

/// Receives every breaker event. Called outside the breaker's lock.
pub trait BreakerObserver: Send + Sync {
    fn on_event(&self, breaker: &str, event: &BreakerEvent);
}

impl<F> BreakerObserver for F
where
    F: Fn(&str, &BreakerEvent) + Send + Sync,
{
    fn on_event(&self, breaker: &str, event: &BreakerEvent) {
        self(breaker, event)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    /// Failed share of completed calls, in percent.
    pub error_rate: f64,
    pub last_state_change: DateTime<Utc>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

// =====================================================
// INTERNAL STATE
// =====================================================

struct Record {
    at: Instant,
    failed: bool,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    window: VecDeque<Record>,
    half_open_in_flight: u32,
    shut_down: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            last_state_change_at: Utc::now(),
            window: VecDeque::new(),
            half_open_in_flight: 0,
            shut_down: false,
        }
    }

    fn prune(&mut self, now: Instant, time_window: Duration) {
        let Some(cutoff) = now.checked_sub(time_window) else {
            return;
        };
        while self.window.front().is_some_and(|r| r.at < cutoff) {
            self.window.pop_front();
        }
    }

    fn push_record(&mut self, now: Instant, failed: bool) {
        if self.window.len() >= MAX_WINDOW_ENTRIES {
            self.window.pop_front();
        }
        self.window.push_back(Record { at: now, failed });
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|r| r.failed).count()
    }
}

struct Shared {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observers: RwLock<Vec<Arc<dyn BreakerObserver>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Single authority for state changes. Resets the per-state counters and
    /// the outcome window.
    fn transition(
        &self,
        st: &mut BreakerState,
        to: CircuitState,
        now: Instant,
        events: &mut Vec<BreakerEvent>,
    ) {
        let from = st.state;
        if from == to {
            return;
        }

        st.state = to;
        st.window.clear();
        st.failure_count = 0;
        st.success_count = 0;
        st.half_open_in_flight = 0;
        st.last_state_change = now;
        st.last_state_change_at = Utc::now();

        match to {
            CircuitState::Open => {
                warn!(
                    name = %self.config.name,
                    from = %from,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
                events.push(BreakerEvent::Open);
            }
            CircuitState::HalfOpen => {
                info!(name = %self.config.name, "Circuit breaker transitioning to half-open");
                events.push(BreakerEvent::HalfOpen);
            }
            CircuitState::Closed => {
                info!(name = %self.config.name, from = %from, "Circuit breaker closed");
                events.push(BreakerEvent::Close);
            }
        }
        events.push(BreakerEvent::StateChange { from, to });
    }

    /// Open → HalfOpen once the reset timeout has elapsed. Reached from both
    /// the lazy admission check and the scheduled timer; a no-op for the loser.
    fn attempt_half_open(
        &self,
        st: &mut BreakerState,
        now: Instant,
        events: &mut Vec<BreakerEvent>,
    ) -> bool {
        if st.shut_down || st.state != CircuitState::Open {
            return false;
        }
        if now.saturating_duration_since(st.last_state_change) < self.config.reset_timeout {
            return false;
        }
        self.transition(st, CircuitState::HalfOpen, now, events);
        true
    }

    fn should_trip(&self, st: &BreakerState) -> bool {
        let recent = st.window.len();
        if (recent as u64) < self.config.minimum_request_volume as u64 || recent == 0 {
            return false;
        }
        let failure_pct = st.window_failures() as f64 / recent as f64 * 100.0;
        st.failure_count >= self.config.failure_threshold
            || failure_pct >= self.config.error_threshold_percentage
    }

    fn reject(
        &self,
        st: &mut BreakerState,
        reason: RejectReason,
        now: Instant,
        events: &mut Vec<BreakerEvent>,
    ) -> CircuitOpenError {
        st.rejected_requests += 1;
        events.push(BreakerEvent::Reject { reason });

        let retry_in = match (reason, st.state) {
            (RejectReason::Open, CircuitState::Open) => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(now.saturating_duration_since(st.last_state_change)),
            ),
            _ => None,
        };
        debug!(name = %self.config.name, reason = ?reason, "Circuit breaker rejected call");

        CircuitOpenError {
            name: self.config.name.clone(),
            state: st.state,
            reason,
            retry_in,
        }
    }
}

/// Releases a half-open probe slot if the call is abandoned mid-flight.
struct Admission<'a> {
    shared: &'a Shared,
    probe: bool,
}

impl Admission<'_> {
    fn complete(mut self) -> bool {
        let probe = self.probe;
        self.probe = false;
        probe
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe {
            let mut st = lock(&self.shared.state);
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
    }
}

// =====================================================
// CIRCUIT BREAKER
// =====================================================

/// Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ExchangeError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BreakerState::new()),
                observers: RwLock::new(Vec::new()),
                timer: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.shared.state).state
    }

    pub fn subscribe(&self, observer: Arc<dyn BreakerObserver>) {
        write(&self.shared.observers).push(observer);
    }

    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&str, &BreakerEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(f));
    }

    /// Run `operation` through the breaker. The operation's own error is
    /// returned untouched; rejections become `E` via `From<CircuitOpenError>`.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + fmt::Display,
    {
        let admission = self.admit()?;
        let started = Instant::now();

        match operation().await {
            Ok(value) => {
                let probe = admission.complete();
                self.on_success(probe, started.elapsed());
                Ok(value)
            }
            Err(e) => {
                let probe = admission.complete();
                self.on_failure(probe, e.to_string(), started.elapsed());
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<Admission<'_>, CircuitOpenError> {
        let shared = &*self.shared;
        let now = Instant::now();
        let mut events = Vec::new();

        let result = {
            let mut st = lock(&shared.state);
            st.total_requests += 1;

            if st.shut_down {
                Err(shared.reject(&mut st, RejectReason::ShutDown, now, &mut events))
            } else {
                shared.attempt_half_open(&mut st, now, &mut events);
                match st.state {
                    CircuitState::Closed => Ok(false),
                    CircuitState::Open => {
                        Err(shared.reject(&mut st, RejectReason::Open, now, &mut events))
                    }
                    CircuitState::HalfOpen => {
                        if st.half_open_in_flight < shared.config.half_open_max_calls {
                            st.half_open_in_flight += 1;
                            Ok(true)
                        } else {
                            Err(shared.reject(
                                &mut st,
                                RejectReason::ProbeInFlight,
                                now,
                                &mut events,
                            ))
                        }
                    }
                }
            }
        };

        self.emit(&events);
        result.map(|probe| Admission { shared, probe })
    }

    fn on_success(&self, probe: bool, latency: Duration) {
        let shared = &*self.shared;
        let now = Instant::now();
        let mut events = vec![BreakerEvent::Success { latency }];
        {
            let mut st = lock(&shared.state);
            if probe {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
            st.successful_requests += 1;
            st.prune(now, shared.config.time_window);
            st.push_record(now, false);

            match st.state {
                CircuitState::Closed => st.failure_count = 0,
                CircuitState::HalfOpen => {
                    st.success_count += 1;
                    if st.success_count >= shared.config.success_threshold {
                        shared.transition(&mut st, CircuitState::Closed, now, &mut events);
                    }
                }
                // Late completion of a call admitted before the trip.
                CircuitState::Open => {}
            }
        }
        self.emit(&events);
    }

    fn on_failure(&self, probe: bool, error: String, latency: Duration) {
        let shared = &*self.shared;
        let now = Instant::now();
        let mut events = vec![BreakerEvent::Failure { error, latency }];
        {
            let mut st = lock(&shared.state);
            if probe {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
            st.failed_requests += 1;
            st.last_failure_time = Some(now);
            st.prune(now, shared.config.time_window);
            st.push_record(now, true);

            match st.state {
                CircuitState::Closed => {
                    st.failure_count += 1;
                    if shared.should_trip(&st) {
                        debug!(
                            name = %shared.config.name,
                            failures = st.failure_count,
                            window = st.window.len(),
                            "Failure threshold reached"
                        );
                        shared.transition(&mut st, CircuitState::Open, now, &mut events);
                    }
                }
                CircuitState::HalfOpen => {
                    shared.transition(&mut st, CircuitState::Open, now, &mut events);
                }
                CircuitState::Open => {}
            }
        }
        self.emit(&events);
    }

    /// Force the breaker closed, clearing the window.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut st = lock(&self.shared.state);
            st.window.clear();
            self.shared.transition(&mut st, CircuitState::Closed, now, &mut events);
            st.failure_count = 0;
            st.success_count = 0;
        }
        if let Some(timer) = lock(&self.shared.timer).take() {
            timer.abort();
        }
        self.emit(&events);
    }

    /// Cancel the pending timer and drop all observers. Every later call is
    /// rejected with `RejectReason::ShutDown`.
    pub fn shutdown(&self) {
        lock(&self.shared.state).shut_down = true;
        if let Some(timer) = lock(&self.shared.timer).take() {
            timer.abort();
        }
        write(&self.shared.observers).clear();
        info!(name = %self.shared.config.name, "Circuit breaker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.shared.state).shut_down
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let st = lock(&self.shared.state);
        let completed = st.successful_requests + st.failed_requests;
        let error_rate = if completed == 0 {
            0.0
        } else {
            st.failed_requests as f64 / completed as f64 * 100.0
        };

        CircuitBreakerMetrics {
            state: st.state,
            total_requests: st.total_requests,
            successful_requests: st.successful_requests,
            failed_requests: st.failed_requests,
            rejected_requests: st.rejected_requests,
            error_rate,
            last_state_change: st.last_state_change_at,
            consecutive_successes: match st.state {
                CircuitState::HalfOpen => st.success_count,
                _ => 0,
            },
            consecutive_failures: match st.state {
                CircuitState::Closed => st.failure_count,
                _ => 0,
            },
        }
    }

    fn emit(&self, events: &[BreakerEvent]) {
        if events.is_empty() {
            return;
        }
        if events.iter().any(|e| matches!(e, BreakerEvent::Open)) {
            self.schedule_half_open();
        }

        let observers: Vec<Arc<dyn BreakerObserver>> = read(&self.shared.observers).clone();
        for observer in &observers {
            for event in events {
                observer.on_event(&self.shared.config.name, event);
            }
        }
    }

    fn schedule_half_open(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(name = %self.shared.config.name, "No runtime for half-open timer, relying on lazy check");
            return;
        };

        let shared = Arc::downgrade(&self.shared);
        let delay = self.shared.config.reset_timeout;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                CircuitBreaker { shared }.half_open_timer_fired();
            }
        });

        if let Some(previous) = lock(&self.shared.timer).replace(task) {
            previous.abort();
        }
    }

    fn half_open_timer_fired(&self) {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut st = lock(&self.shared.state);
            self.shared.attempt_half_open(&mut st, now, &mut events);
        }
        self.emit(&events);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .finish()
    }
}
