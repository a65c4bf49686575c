//! Stockroom service binary.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use stockroom::{Config, Stockroom, connect};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "stockroom=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stockroom");

    let config = Config::from_env();
    info!(
        brokers = %config.redpanda.brokers,
        consumer_group = %config.redpanda.consumer_group,
        "Configuration loaded"
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(port = config.metrics_port, "Prometheus metrics available at /metrics");

    let collaborators = connect(&config).await?;
    let (_catalog, app) = Stockroom::assemble(collaborators, &config).start();

    app.run().await;
    Ok(())
}
