//! Resilience Module - Rate Limiting, Circuit Breakers, Retries, Bulkheads
//! Fault tolerance patterns shared by every exchange adapter

mod bulkhead;
mod circuit_breaker;
mod executor;
mod rate_limiter;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    BreakerEvent, BreakerObserver, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitState,
};
pub use executor::{
    Fallback, FailureContext, FailureKind, FailureObserver, ResilienceConfig, ResilientExecutor,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{
    run_with_retry, RetryCallback, RetryConfig, RetryPolicy, RetryPredicate, RetryStats,
    RetryStatsSnapshot,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Critical sections never await and never leave state half-written, so a
// poisoned lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
