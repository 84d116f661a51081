//! Error Taxonomy
//! Closed set of failure kinds shared by the breaker, retry policy and pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::CircuitState;

// =====================================================
// ERROR KIND
// =====================================================

/// Classification bucket for an error. Retry decisions are made per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ExchangeUnavailable,
    Network,
    InvalidRequest,
    Authentication,
    CircuitOpen,
    BulkheadFull,
    Configuration,
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Kinds retried when no explicit list or predicate is configured.
    pub const DEFAULT_RETRYABLE: [ErrorKind; 3] = [
        ErrorKind::RateLimit,
        ErrorKind::ExchangeUnavailable,
        ErrorKind::Network,
    ];

    pub fn is_retryable_by_default(self) -> bool {
        Self::DEFAULT_RETRYABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ExchangeUnavailable => "exchange_unavailable",
            ErrorKind::Network => "network",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Authentication => "authentication",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lets the retry policy and executor reason about any error type.
pub trait ClassifyError {
    fn kind(&self) -> ErrorKind;

    /// Server-provided delay that overrides the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

// =====================================================
// CIRCUIT OPEN
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Open and still inside the reset timeout.
    Open,
    /// Half-open with every probe slot taken.
    ProbeInFlight,
    /// The breaker was shut down with its adapter.
    ShutDown,
}

/// Returned by the breaker without invoking the wrapped operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit breaker '{name}' rejected call ({reason:?}, state {state:?})")]
pub struct CircuitOpenError {
    pub name: String,
    pub state: CircuitState,
    pub reason: RejectReason,
    /// Time left before a probe will be admitted, when known.
    pub retry_in: Option<Duration>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bulkhead '{name}' queue is full ({queued} waiting)")]
pub struct BulkheadFullError {
    pub name: String,
    pub queued: usize,
}

// =====================================================
// EXCHANGE ERROR
// =====================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("weight {weight} exceeds limiter capacity of {max_tokens} tokens")]
    WeightExceedsCapacity { weight: u32, max_tokens: u32 },

    #[error(transparent)]
    BulkheadFull(#[from] BulkheadFullError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    /// Maps a non-success HTTP status to its error class.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let body = body.into();
        match status {
            429 => ExchangeError::RateLimitExceeded {
                message: body,
                retry_after,
            },
            401 | 403 => ExchangeError::Authentication(body),
            408 => ExchangeError::Network(format!("HTTP 408: {}", body)),
            500..=599 => ExchangeError::ExchangeUnavailable(format!("HTTP {}: {}", status, body)),
            _ => ExchangeError::Http { status, body },
        }
    }
}

impl ClassifyError for ExchangeError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ExchangeError::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            ExchangeError::Network(_) | ExchangeError::Timeout(_) => ErrorKind::Network,
            ExchangeError::ExchangeUnavailable(_) => ErrorKind::ExchangeUnavailable,
            ExchangeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ExchangeError::Http { status, .. } if (400..500).contains(status) => {
                ErrorKind::InvalidRequest
            }
            ExchangeError::Http { .. } => ErrorKind::Other,
            ExchangeError::Authentication(_) => ErrorKind::Authentication,
            ExchangeError::WeightExceedsCapacity { .. } | ExchangeError::Configuration(_) => {
                ErrorKind::Configuration
            }
            ExchangeError::BulkheadFull(_) => ErrorKind::BulkheadFull,
            ExchangeError::Cancelled => ErrorKind::Cancelled,
            ExchangeError::Decode(_) | ExchangeError::Other(_) => ErrorKind::Other,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// =====================================================
// REQUEST ERROR (PIPELINE EXIT)
// =====================================================

/// Error leaving the request pipeline, stamped for cross-log tracing.
#[derive(Error, Debug, Clone)]
#[error("[{correlation_id}] {endpoint} failed after {attempts} attempt(s): {source}")]
pub struct RequestError {
    pub correlation_id: String,
    pub endpoint: String,
    pub attempts: u32,
    #[source]
    pub source: ExchangeError,
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

impl ClassifyError for RequestError {
    fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.source.retry_after()
    }
}
