//! Environment-backed configuration, one group per subsystem.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(name = "pixelrelay", about = "Asynchronous image processing service")]
pub struct Config {
    #[clap(flatten)]
    pub http: Http,
    #[clap(flatten)]
    pub log: Log,
    #[clap(flatten)]
    pub pg: Pg,
    #[clap(flatten)]
    pub s3: S3,
    #[clap(flatten)]
    pub kafka: Kafka,
    #[clap(flatten)]
    pub outbox_relay: OutboxRelay,
    #[clap(flatten)]
    pub kafka_controller: KafkaController,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Http {
    #[clap(long, env = "HTTP_PORT", default_value = "8080")]
    pub http_port: u16,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Log {
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Pg {
    #[clap(long, env = "PG_URL")]
    pub pg_url: String,
    #[clap(long, env = "PG_POOL_MAX", default_value = "10")]
    pub pg_pool_max: u32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct S3 {
    #[clap(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: String,
    #[clap(long, env = "S3_ACCESS_KEY")]
    pub s3_access_key: String,
    #[clap(long, env = "S3_SECRET_KEY")]
    pub s3_secret_key: String,
    #[clap(long, env = "S3_BUCKET")]
    pub s3_bucket: String,
    #[clap(long, env = "S3_LOAD_CFG_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub s3_load_cfg_timeout: Duration,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Kafka {
    #[clap(long, env = "KAFKA_BROKERS", value_delimiter = ',')]
    pub kafka_brokers: Vec<String>,
    #[clap(long, env = "KAFKA_GROUP_ID")]
    pub kafka_group_id: String,
    #[clap(long, env = "KAFKA_TOPIC")]
    pub kafka_topic: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct OutboxRelay {
    #[clap(long, env = "OUTBOX_RELAY_POLL_INTERVAL", default_value = "2s", value_parser = humantime::parse_duration)]
    pub outbox_relay_poll_interval: Duration,
    #[clap(long, env = "OUTBOX_RELAY_MARK_FAILED_INTERVAL", default_value = "2m", value_parser = humantime::parse_duration)]
    pub outbox_relay_mark_failed_interval: Duration,
    #[clap(long, env = "OUTBOX_RELAY_CLEANUP_INTERVAL", default_value = "24h", value_parser = humantime::parse_duration)]
    pub outbox_relay_cleanup_interval: Duration,
    #[clap(long, env = "OUTBOX_RELAY_PROCESS_BATCH_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub outbox_relay_process_batch_timeout: Duration,
    #[clap(long, env = "OUTBOX_RELAY_SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub outbox_relay_shutdown_timeout: Duration,
    #[clap(long, env = "OUTBOX_RELAY_CLAIM_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub outbox_relay_claim_timeout: Duration,
    #[clap(long, env = "OUTBOX_RELAY_RETENTION", default_value = "7days", value_parser = humantime::parse_duration)]
    pub outbox_relay_retention: Duration,
    #[clap(long, env = "OUTBOX_RELAY_BATCH_SIZE", default_value = "100")]
    pub outbox_relay_batch_size: i64,
    #[clap(long, env = "OUTBOX_RELAY_MAX_RETRIES", default_value = "3")]
    pub outbox_relay_max_retries: i32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct KafkaController {
    #[clap(long, env = "KAFKA_CONTROLLER_COMMIT_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub kafka_controller_commit_timeout: Duration,
    #[clap(long, env = "KAFKA_CONTROLLER_PROCESS_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub kafka_controller_process_timeout: Duration,
    #[clap(long, env = "KAFKA_CONTROLLER_CPU_TIMEOUT", default_value = "8s", value_parser = humantime::parse_duration)]
    pub kafka_controller_cpu_timeout: Duration,
    #[clap(long, env = "KAFKA_CONTROLLER_SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub kafka_controller_shutdown_timeout: Duration,
}
