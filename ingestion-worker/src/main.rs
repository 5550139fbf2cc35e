//! Consume events from the NATS events stream and persist them to Postgres.
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingestion_common::health::HealthRegistry;
use ingestion_common::metrics::{serve, setup_metrics_routes};
use ingestion_common::retry::RetryPolicy;
use ingestion_common::store::PgEventStore;
use ingestion_worker::config::Config;
use ingestion_worker::consumer::{connect_with_retry, JetStreamSource};
use ingestion_worker::worker::IngestionWorker;

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("async_nats=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();

    Ok(())
}

pub async fn index() -> &'static str {
    "ingestion worker"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;
    info!("Starting ingestion worker...");

    let config = Config::init_from_env().context("invalid configuration")?;

    info!(
        stream = config.consumer.stream_name.as_str(),
        consumer = config.consumer.durable_name.as_str(),
        batch_size = config.batch_size,
        "Configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    // A full fetch wait plus a failure pause must fit comfortably inside the deadline.
    let loop_deadline = (config.batch_expires.0 + config.idle_delay.0) * 4;
    let loop_liveness = liveness.register(
        "ingestion_loop",
        time::Duration::try_from(loop_deadline).context("invalid liveness deadline")?,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    let router = setup_metrics_routes(router).context("failed to install metrics recorder")?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(bind = %bind, error = %e, "failed to serve health and metrics");
        }
    });

    let client = connect_with_retry(&config.nats).await?;
    let source = JetStreamSource::new(client, config.consumer.clone());
    // Provisioning failures are fatal: there is nothing to consume from.
    source.ensure_ready().await?;

    let store = PgEventStore::new(
        config.events_table.as_str(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await?;

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let worker = IngestionWorker::new(
        Arc::new(source),
        Arc::new(store),
        retry_policy,
        config.batch_size,
        config.batch_expires.0,
        config.idle_delay.0,
        loop_liveness,
    );

    let mut handle = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("Shutdown signal received");

    handle.stop().await;

    info!("Ingestion worker shut down");
    Ok(())
}
