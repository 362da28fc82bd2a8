//! Order Ingest Binary
//!
//! Runs the ingestion service: Kafka consumer, PostgreSQL store and in-memory
//! cache, until SIGINT or SIGTERM.

use order_ingest::bootstrap::IngestBootstrap;
use order_ingest::config::IngestConfig;
use order_ingest::logging::init_structured_logging;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config = IngestConfig::load()?;
    info!(
        topic = %config.kafka_topic,
        group_id = %config.kafka_group_id,
        postgres = %config.redacted_dsn(),
        producer_enabled = config.producer_enabled,
        "Starting order ingest service"
    );

    let system = IngestBootstrap::bootstrap(&config).await.map_err(|e| {
        error!(error = %e, "❌ Startup failed");
        e
    })?;

    system.run_until_shutdown().await?;
    info!("Order ingest service stopped");
    Ok(())
}
