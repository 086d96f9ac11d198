use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use promptpool::broadcast::Broadcaster;
use promptpool::config::{CoordinatorConfig, EndpointConfig};
use promptpool::conn::{ConnectionManager, FrameSink};
use promptpool::driver::{AutomationDriver, NullDriver};
use promptpool::monitor::ResponseMonitor;
use promptpool::registry::{WorkerRegistry, recovery};
use promptpool::router::{Router, spawn_message_cleanup};
use promptpool::store::{MemoryStore, SharedStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let endpoints_raw =
        std::env::var("POOL_ENDPOINTS").unwrap_or_else(|_| "127.0.0.1:8765".to_string());
    let endpoints =
        EndpointConfig::parse_list(&endpoints_raw).context("invalid POOL_ENDPOINTS")?;

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkerRegistry::new(Arc::clone(&store), config.clone()));
    let driver: Arc<dyn AutomationDriver> = Arc::new(NullDriver);

    let observed = driver.scan().await.context("initial worker scan failed")?;
    info!(workers = observed.len(), "initial worker scan complete");
    registry
        .sync_observations(observed)
        .await
        .context("failed to seed worker registry")?;

    let (manager, inbound_rx) = ConnectionManager::new(config.clone(), Arc::clone(&store));
    let manager = Arc::new(manager);
    let sink: Arc<dyn FrameSink> = Arc::clone(&manager) as Arc<dyn FrameSink>;

    let monitor = Arc::new(ResponseMonitor::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&driver),
        Arc::clone(&store),
        Arc::clone(&sink),
    ));
    let (broadcaster, _broadcast_task) = Broadcaster::spawn(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&sink),
        store.subscribe(),
        manager.subscribe_events(),
    );
    let router = Arc::new(Router::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&driver),
        monitor,
        broadcaster.clone(),
        Arc::clone(&sink),
    ));

    let _cleanup_task = spawn_message_cleanup(Arc::clone(&store), config.clone());
    let _recovery_task = recovery::spawn(
        Arc::clone(&registry),
        Arc::clone(&driver),
        config.recovery_interval,
    );
    let router_task = tokio::spawn(Arc::clone(&router).run(inbound_rx));

    manager.connect_all(endpoints).await?;
    broadcaster.request_broadcast().await;
    info!(name = %config.name, "coordinator started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    manager.shutdown().await;
    router_task.abort();
    Ok(())
}

fn load_config() -> anyhow::Result<CoordinatorConfig> {
    let mut config = CoordinatorConfig::default();
    if let Ok(name) = std::env::var("POOL_NAME") {
        config.name = name;
    }
    if let Ok(raw) = std::env::var("POOL_LIVENESS_TIMEOUT_SECS") {
        config.liveness_timeout = Duration::from_secs(
            raw.parse()
                .context("POOL_LIVENESS_TIMEOUT_SECS must be a number of seconds")?,
        );
    }
    if let Ok(raw) = std::env::var("POOL_RECONNECT_DELAY_SECS") {
        config.reconnect_delay = Duration::from_secs(
            raw.parse()
                .context("POOL_RECONNECT_DELAY_SECS must be a number of seconds")?,
        );
    }
    if let Ok(raw) = std::env::var("POOL_MAX_POLLS") {
        config.max_polls = raw.parse().context("POOL_MAX_POLLS must be a number")?;
    }
    Ok(config)
}
