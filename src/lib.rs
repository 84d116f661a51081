//! Venue Resilience - Client-Side Fault Tolerance for Exchange Adapters
//! Rate limiting, circuit breaking, retries and a request pipeline that ties them together

pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod resilience;

mod serde_millis;

pub use error::{ClassifyError, ErrorKind, ExchangeError, RequestError};
pub use pipeline::{ApiRequest, ApiResponse, PipelineConfig, RequestPipeline};
pub use resilience::{CircuitBreaker, RateLimiter, ResilientExecutor, RetryPolicy};
