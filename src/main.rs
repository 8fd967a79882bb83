//! StrasBoard - dashboard data server
//!
//! Serves weather, public transport, indoor temperature, electricity
//! consumption and tariff colour data as JSON, each cached according to how
//! often its upstream actually changes.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strasboard::aggregator::Aggregator;
use strasboard::cache::ResponseCache;
use strasboard::cli::{Cli, Config};
use strasboard::clock::{SharedClock, SystemClock};
use strasboard::data::{
    ElectricitySource, HttpClient, Source, SubEntitySource, TemperatureSource, TempoSource,
    TransportSource, WeatherSource,
};
use strasboard::server::{router, AppState};

/// Sets up the tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves once Ctrl-C is received
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    // Before validation, so configuration warnings are not dropped
    init_tracing(&cli.log_level);
    let config = Config::from_cli(&cli)?;

    let clock: SharedClock = Arc::new(SystemClock);
    let http = HttpClient::new().context("failed to build HTTP client")?;

    let transport = Arc::new(TransportSource::new(
        config.transport,
        http.clone(),
        clock.clone(),
    ));
    let electricity = ElectricitySource::new(config.electricity, http.clone(), clock.clone())
        .ok_or_else(|| anyhow!("invalid electricity cutoff hour"))?;
    let tempo = TempoSource::new(config.tempo, http.clone(), clock.clone())
        .ok_or_else(|| anyhow!("invalid tempo cutoff hours"))?;

    let sources: Vec<Arc<dyn Source>> = vec![
        Arc::new(WeatherSource::new(config.weather, http.clone(), clock.clone())),
        transport.clone(),
        Arc::new(TemperatureSource::new(
            config.temperature,
            http.clone(),
            clock.clone(),
        )),
        Arc::new(electricity),
        Arc::new(tempo),
    ];
    let live: Arc<dyn SubEntitySource> = transport;

    let cache = ResponseCache::new(clock.clone());
    let aggregator = Arc::new(Aggregator::new(
        sources,
        cache,
        clock,
        config.source_timeout,
    )?);
    info!(sources = ?aggregator.source_names(), "sources registered");

    if config.warm_up {
        // Detached; the task logs its own summary
        let _warm_up = aggregator.warm_up();
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(address = %config.listen, "StrasBoard server listening");

    let state = AppState { aggregator, live };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}
