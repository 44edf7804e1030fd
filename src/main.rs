use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod api;
mod cache;
mod config;
mod error;
mod live;
mod manager;
mod models;
mod persist;
mod shutdown;
#[cfg(test)]
mod testkit;

use api::ApiState;
use cache::SnapshotCache;
use config::Config;
use live::{HttpFetcherFactory, HttpLister};
use manager::{MatchManager, WorkerTable};
use persist::Persister;
use shutdown::{join_with_timeout, JoinBounds, ShutdownCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    info!("Starting livefetch against {}", config.target_url);
    info!("Snapshots will be written to {}", config.data_file);

    let coordinator = ShutdownCoordinator::new();
    let _signals = coordinator.spawn_signal_listener();
    let shutdown = coordinator.token();

    let cache = SnapshotCache::new();
    let workers = WorkerTable::new();

    let lister = Arc::new(HttpLister::new(&config.target_url, config.request_timeout())?);
    let factory = Arc::new(HttpFetcherFactory::new(
        &config.target_url,
        config.request_timeout(),
    )?);

    // Optional read API over the persisted file
    let api_task = config.api_socket_addr()?.map(|addr| {
        let state = ApiState {
            data_file: PathBuf::from(&config.data_file),
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, token).await {
                error!("Read API failed: {}", e);
            }
        })
    });

    let persister = Persister::new(
        cache.clone(),
        &config.data_file,
        config.persist_interval(),
        config.empty_policy,
    );
    let persister_task = tokio::spawn(persister.run(shutdown.clone()));

    let manager = MatchManager::new(
        lister,
        factory,
        cache.clone(),
        workers.clone(),
        config.manager_settings(),
        shutdown.clone(),
        coordinator.worker_token(),
    );
    let mut manager_task = tokio::spawn(manager.run());

    // Run until a signal arrives, or the discovery loop dies on its own
    let manager_done = tokio::select! {
        _ = shutdown.cancelled() => false,
        res = &mut manager_task => {
            if let Err(e) = res {
                error!("Discovery loop ended abnormally: {}", e);
            }
            true
        }
    };
    if manager_done {
        coordinator.trigger("discovery loop exited");
    }

    let bounds = JoinBounds {
        discovery: config.worker_join_timeout(),
        persister: config.persister_join_timeout(),
        worker: config.worker_join_timeout(),
    };
    let discovery = if manager_done { None } else { Some(manager_task) };
    coordinator
        .drain(discovery, persister_task, &workers, &bounds)
        .await;

    if let Some(task) = api_task {
        join_with_timeout("read API", task, config.worker_join_timeout()).await;
    }

    info!("Shutdown complete.");
    Ok(())
}
