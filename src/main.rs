use anyhow::{Context, Result};
use artery::broker::{create_broker_router, StreamBroker};
use artery::config::{apply_env_overrides, load_config, ArteryConfig};
use artery::ingest::{create_ingest_router, TickPipeline};
use artery::ledger::ErrorLedger;
use artery::record::Normalizer;
use artery::upstream::{run_status_publisher, OfflineUpstream};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artery=info".into()),
        )
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", path, e))?,
        None => ArteryConfig::default(),
    };
    apply_env_overrides(&mut config);

    info!(bind_addr = %config.broker.bind_addr, "artery starting");

    let ledger = Arc::new(ErrorLedger::new(config.ledger.capacity));
    let broker = Arc::new(StreamBroker::new(config.broker.clone(), Arc::clone(&ledger)));
    let pipeline = Arc::new(TickPipeline::new(
        Normalizer::new(config.geo.clone()),
        Arc::clone(&broker),
        Arc::clone(&ledger),
    ));

    // Upstream connectivity is published even with no simulation attached,
    // so viewers can tell the broker from the source being down
    tokio::spawn(run_status_publisher(
        Arc::clone(&broker),
        Arc::new(OfflineUpstream),
        config.broker.status_interval_secs,
    ));

    let app = create_broker_router(Arc::clone(&broker)).merge(create_ingest_router(pipeline));

    let listener = tokio::net::TcpListener::bind(&config.broker.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.broker.bind_addr))?;
    info!("listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
