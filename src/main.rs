use batcher::{
    api::Server,
    batch::{BatchingEngine, EngineSettings},
    config::Config,
    gateway::{GatewayClient, GatewayRef},
    notify::{NotifierRef, WebhookNotifier},
    registry,
    scheduler::{BatchClock, Scheduler},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// The main entry point for the batcher.
///
/// Configuration path: first argument, then `BATCHER_CONFIG`, then
/// `config/default.toml`. `RUST_LOG` overrides the configured log level.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BATCHER_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into();
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Batcher starting with config from {}", config_path.display());

    let store = registry::open(&config.database.url).await?;
    info!("Registry opened at {}", config.database.url);

    let gateway: GatewayRef = Arc::new(GatewayClient::new(&config.gateway)?);
    let notifier: NotifierRef = Arc::new(WebhookNotifier::new(&config.notifier)?);

    // Engine and scheduler share the batch window
    let clock = Arc::new(BatchClock::new(config.batch.timeout_period()));
    let engine = Arc::new(BatchingEngine::new(
        store,
        gateway.clone(),
        notifier,
        clock.clone(),
        EngineSettings::from(&config),
    ));

    let scheduler = Arc::new(Scheduler::new(engine.clone(), clock));
    scheduler.start(&config.batch);

    let server = Server::new(config, config_path, engine, scheduler, gateway);
    server.start().await?;

    Ok(())
}
