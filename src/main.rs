//! Venue Gateway - Resilient Exchange Client Demo Service
//! Drives a simulated venue through the request pipeline and exposes health/metrics

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use venue_resilience::config::Config;
use venue_resilience::observability::{
    self,
    health::{start_health_server, HealthState},
};
use venue_resilience::pipeline::{ApiRequest, RequestPipeline, SimulatedVenue};

const LOAD_ENDPOINTS: [&str; 3] = ["/api/v3/time", "/api/v3/ticker/price", "/api/v3/depth"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    observability::init_observability("venue-gateway")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        exchange = %config.pipeline.exchange,
        "Starting Venue Gateway..."
    );

    let venue = Arc::new(SimulatedVenue::new(
        config.pipeline.exchange.clone(),
        config.simulated_failure_rate,
        config.simulated_latency,
    ));
    let pipeline = Arc::new(RequestPipeline::new(config.pipeline.clone(), venue)?);

    pipeline.circuit_breaker().on_event(|name, event| {
        debug!(breaker = %name, event = ?event, "Breaker event");
    });

    // Start health/metrics server
    let health_state = HealthState {
        pipeline: pipeline.clone(),
        ready: Arc::new(AtomicBool::new(true)),
    };
    let metrics_port = config.metrics_port;

    tokio::spawn(async move {
        if let Err(e) = start_health_server(metrics_port, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    // Graceful shutdown handler
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let load = {
        let pipeline = pipeline.clone();
        let load_interval = config.load_interval;
        async move {
            let mut ticker = interval(load_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: usize = 0;

            loop {
                ticker.tick().await;
                let path = LOAD_ENDPOINTS[tick % LOAD_ENDPOINTS.len()];
                tick = tick.wrapping_add(1);

                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    match pipeline.request(ApiRequest::get(path)).await {
                        Ok(response) => debug!(path = path, status = response.status, "Venue call ok"),
                        Err(e) => warn!(error = %e, kind = %e.kind(), "Venue call failed"),
                    }
                });
            }
        }
    };

    tokio::select! {
        _ = load => {}
        _ = shutdown_rx.recv() => {
            info!("Shutting down...");
        }
    }

    pipeline.disconnect();
    let snapshot = pipeline.metrics_snapshot();
    info!(
        total = snapshot.total_requests,
        success_rate = snapshot.success_rate,
        "Venue Gateway stopped"
    );
    Ok(())
}
