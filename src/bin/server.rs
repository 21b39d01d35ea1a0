//! mesh-server: serves a hydrated replica of the mesh graph and accepts
//! policy intents over HTTP.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use mesh_context::{
    channel::{RedisChannel, SharedChannel},
    config::ServerConfig,
    endpoints,
    graph::{Facets, GraphStore},
    hydrator::Hydrator,
    logging::{init_logging, LoggingConfig},
    service::MeshContextService,
    shutdown,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_logging(LoggingConfig::from(&config.logging));

    let redis = config.redis();
    redis
        .validate()
        .map_err(|e| anyhow!("invalid redis configuration: {e}"))?;
    let channel: SharedChannel =
        Arc::new(RedisChannel::new(&redis).context("failed to create Redis channel")?);

    let store = GraphStore::new();
    let cancel = shutdown::install();

    let hydrator = Arc::new(Hydrator::new(store.clone(), channel.clone(), Facets::ALL));
    hydrator.hydrate().await;
    let subscriber = tokio::spawn(hydrator.run(cancel.clone(), config.resubscribe_delay()));

    let service = MeshContextService::new(store, channel);
    let served = endpoints::serve(service, config.listen_addr, cancel.clone())
        .await
        .with_context(|| format!("failed to serve on {}", config.listen_addr));

    cancel.cancel();
    if let Err(e) = subscriber.await {
        tracing::error!(error = %e, "Delta subscriber task panicked");
    }
    served?;

    info!("Server stopped");
    Ok(())
}
