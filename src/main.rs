//! Tool Gateway server entry point.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use tool_gateway::config::{AppConfig, MonitoringConfig};
use tool_gateway::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    telemetry::init(&config.logging);

    install_metrics_exporter(&config.monitoring)?;

    server::start_server(Arc::new(config)).await
}

fn install_metrics_exporter(config: &MonitoringConfig) -> anyhow::Result<()> {
    let Some(listen) = config.prometheus_listen.as_deref() else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid monitoring.prometheus_listen '{listen}'"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(name: "metrics.exporter.started", address = %addr, "Prometheus exporter listening");
    Ok(())
}
