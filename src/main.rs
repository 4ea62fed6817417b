use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use raven_chat::{cache, run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let cache = cache::shared(config.cache.ttl, config.cache.capacity);

    run_server(config, cache).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
