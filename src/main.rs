//! Simularium Server entry point: wires together the trajectory cache,
//! simulation backends, and the four-worker orchestrator, then serves
//! WebSocket connections until shutdown.

use std::sync::Arc;

use simularium_server::{
    ServerConfig, Simulation, SyntheticSimPkg, TrajectoryCache, WorkerOrchestrator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    simularium_server::init_logging();

    let config = ServerConfig::from_args();
    tracing::info!(port = config.port, environment = %config.app_environment, "starting simularium-server");

    tokio::fs::create_dir_all(&config.cache_dir).await?;

    let object_store: Arc<dyn simularium_server::ObjectStore> = Arc::new(
        simularium_server::S3ObjectStore::new(config.bucket.clone()).await,
    );
    let cache = Arc::new(TrajectoryCache::new(config.cache_dir.clone(), object_store));

    let sim_pkg: Arc<dyn simularium_server::SimPkg> = Arc::new(SyntheticSimPkg::new(1.0));
    let simulation = Arc::new(Simulation::new(cache, vec![sim_pkg]));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let orchestrator = Arc::new(WorkerOrchestrator::new(config, simulation));

    tokio::select! {
        result = orchestrator.clone().run(addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server exited with error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
            orchestrator.close_server();
        }
    }

    Ok(())
}
