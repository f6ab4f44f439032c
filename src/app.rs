//! Process bootstrap: connect the adapters, start the relay and the
//! controller, serve HTTP, and tear everything down in reverse order.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use crate::blob::{S3Blob, s3};
use crate::bus::{KafkaConsumer, KafkaPublisher};
use crate::config::Config;
use crate::controller::{ControllerConfig, ProcessingController};
use crate::http::{self, AppState};
use crate::relay::{OutboxRelay, RelayConfig};
use crate::service::ImageService;
use crate::store::PgMetadata;

pub async fn run(config: Config) -> anyhow::Result<()> {
    // Blob store. The SDK's config load can stall on a broken endpoint, so
    // it gets its own deadline.
    let client = tokio::time::timeout(
        config.s3.s3_load_cfg_timeout,
        s3::create_client(
            &config.s3.s3_endpoint,
            &config.s3.s3_access_key,
            &config.s3.s3_secret_key,
        ),
    )
    .await
    .context("s3 configuration load timed out")?;
    let blob = S3Blob::new(client, config.s3.s3_bucket.clone());

    // Metadata store.
    let pool = PgPoolOptions::new()
        .max_connections(config.pg.pg_pool_max)
        .connect(&config.pg.pg_url)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    let service = ImageService::new(PgMetadata::new(pool.clone()), blob);

    // Bus.
    let publisher = KafkaPublisher::connect(
        &config.kafka.kafka_brokers,
        config.kafka.kafka_topic.clone(),
    )
    .context("failed to create kafka producer")?;
    let consumer = Arc::new(
        KafkaConsumer::connect(
            &config.kafka.kafka_brokers,
            &config.kafka.kafka_group_id,
            config.kafka.kafka_topic.clone(),
        )
        .context("failed to create kafka consumer")?,
    );

    let relay = OutboxRelay::new(
        service.clone(),
        publisher,
        RelayConfig {
            poll_interval: config.outbox_relay.outbox_relay_poll_interval,
            mark_failed_interval: config.outbox_relay.outbox_relay_mark_failed_interval,
            cleanup_interval: config.outbox_relay.outbox_relay_cleanup_interval,
            process_batch_timeout: config.outbox_relay.outbox_relay_process_batch_timeout,
            claim_timeout: config.outbox_relay.outbox_relay_claim_timeout,
            retention: config.outbox_relay.outbox_relay_retention,
            batch_size: config.outbox_relay.outbox_relay_batch_size,
            max_retries: config.outbox_relay.outbox_relay_max_retries,
        },
    )
    .start();

    let controller = ProcessingController::new(
        service.clone(),
        consumer,
        ControllerConfig {
            commit_timeout: config.kafka_controller.kafka_controller_commit_timeout,
            process_timeout: config.kafka_controller.kafka_controller_process_timeout,
            cpu_timeout: config.kafka_controller.kafka_controller_cpu_timeout,
            workers: num_cpus::get(),
        },
    )
    .start();

    let app = http::router(AppState { service });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http.http_port))
        .await
        .context("failed to bind http listener")?;
    info!(port = config.http.http_port, "listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "http server failed");
    }

    // Teardown, newest first.
    relay
        .shutdown(config.outbox_relay.outbox_relay_shutdown_timeout)
        .await;
    controller
        .shutdown(config.kafka_controller.kafka_controller_shutdown_timeout)
        .await;
    pool.close().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install interrupt handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install terminate handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received interrupt"),
        _ = terminate => info!("received terminate"),
    }
}
