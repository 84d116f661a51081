//! Observability Module - Structured Logging, Metrics, Health
//! JSON tracing output plus a Prometheus registry for the gateway

pub mod health;
pub mod metrics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the JSON subscriber and register metrics. Safe to call more than
/// once; only the first subscriber wins.
pub fn init_observability(service_name: &str) -> anyhow::Result<()> {
    metrics::init_metrics(service_name)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,venue_resilience=debug"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }

    tracing::info!(service = service_name, "Observability stack initialized");
    Ok(())
}
