//! Resilient Executor
//! Circuit breaker (outermost) → retry policy → optional fallback, as one call

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryPolicy};
use crate::error::{CircuitOpenError, ClassifyError, ExchangeError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retries are skipped entirely when absent.
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The breaker rejected the call before invoking it.
    CircuitOpen,
    /// The breaker admitted the call and every attempt failed.
    RetryExhausted,
    /// The fallback itself failed.
    FallbackFailed,
}

#[derive(Debug)]
pub struct FailureContext<'a, E> {
    pub kind: FailureKind,
    pub breaker: &'a str,
    /// The fallback's error for `FallbackFailed`, otherwise the call's error.
    pub error: &'a E,
    /// The call's error when `error` came from the fallback.
    pub original: Option<&'a E>,
}

pub type Fallback<T, E> = Arc<dyn Fn(FailureKind, &E) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
pub type FailureObserver<E> = Arc<dyn Fn(&FailureContext<'_, E>) + Send + Sync>;

pub struct ResilientExecutor<T, E> {
    breaker: CircuitBreaker,
    retry: Option<RetryPolicy<E>>,
    fallback: Option<Fallback<T, E>>,
    on_failure: Option<FailureObserver<E>>,
}

impl<T, E> ResilientExecutor<T, E>
where
    E: ClassifyError + From<CircuitOpenError> + fmt::Display,
{
    pub fn new(config: ResilienceConfig) -> Result<Self, ExchangeError> {
        if let Some(retry) = &config.retry {
            retry.validate()?;
        }
        let name = config.circuit_breaker.name.clone();
        Ok(Self::from_parts(
            CircuitBreaker::new(config.circuit_breaker)?,
            config.retry.map(|retry| RetryPolicy::new(retry).named(name)),
        ))
    }

    /// Build around an existing breaker, e.g. one shared with a pipeline.
    pub fn from_parts(breaker: CircuitBreaker, retry: Option<RetryPolicy<E>>) -> Self {
        Self {
            breaker,
            retry,
            fallback: None,
            on_failure: None,
        }
    }

    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(FailureKind, &E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: 'static,
        E: 'static,
    {
        self.fallback = Some(Arc::new(
            move |kind: FailureKind, error: &E| -> BoxFuture<'static, Result<T, E>> {
                Box::pin(fallback(kind, error))
            },
        ));
        self
    }

    pub fn on_failure<O>(mut self, observer: O) -> Self
    where
        O: Fn(&FailureContext<'_, E>) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(observer));
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy<E>> {
        self.retry.as_ref()
    }

    fn notify(&self, context: &FailureContext<'_, E>) {
        if let Some(observer) = &self.on_failure {
            observer(context);
        }
    }

    /// Run `operation` through the breaker, retrying inside it when a policy
    /// is configured. Without a fallback the original error comes back as is;
    /// a failing fallback surfaces its own error.
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retry = self.retry.as_ref();
        let mut invoked = false;
        let invoked_flag = &mut invoked;

        let outcome = self
            .breaker
            .execute(move || async move {
                *invoked_flag = true;
                let mut operation = operation;
                match retry {
                    Some(policy) => policy.run(operation).await,
                    None => operation().await,
                }
            })
            .await;

        let failure = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let kind = if invoked {
            FailureKind::RetryExhausted
        } else {
            FailureKind::CircuitOpen
        };
        warn!(
            breaker = %self.breaker.name(),
            kind = ?kind,
            error = %failure,
            "Resilient call failed"
        );
        self.notify(&FailureContext {
            kind,
            breaker: self.breaker.name(),
            error: &failure,
            original: None,
        });

        let Some(fallback) = &self.fallback else {
            return Err(failure);
        };

        match fallback(kind, &failure).await {
            Ok(value) => {
                info!(breaker = %self.breaker.name(), kind = ?kind, "Fallback produced result");
                Ok(value)
            }
            Err(fallback_error) => {
                error!(
                    breaker = %self.breaker.name(),
                    error = %fallback_error,
                    original = %failure,
                    "Fallback failed"
                );
                self.notify(&FailureContext {
                    kind: FailureKind::FallbackFailed,
                    breaker: self.breaker.name(),
                    error: &fallback_error,
                    original: Some(&failure),
                });
                Err(fallback_error)
            }
        }
    }
}
