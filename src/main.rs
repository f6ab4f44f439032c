use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = pixelrelay::config::Config::parse();
    let filter = EnvFilter::try_new(&config.log.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = pixelrelay::app::run(config).await {
        error!(?error, "fatal bootstrap error");
        std::process::exit(1);
    }
}
