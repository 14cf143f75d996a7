use pigtrack_core::config::{DetectorConfig, EngineConfig};
use pigtrack_core::engine::DetectionEngine;
use pigtrack_workers::bootstrap::{connect_store, shutdown_signal};
use pigtrack_workers::detector::DetectorWorker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let store = connect_store().await?;
    let engine = DetectionEngine::new(store.clone(), EngineConfig::from_env());
    let worker = DetectorWorker::new(store, engine, DetectorConfig::from_env());

    worker.run(shutdown_signal()).await;
    Ok(())
}
