//! rhythm server.
//!
//! Wires the pieces together: durable store, secrets backend, HTTP API and
//! the leadership loop. The process waits for scheduler leadership, runs a
//! framework session inside the leadership scope, and re-enters the
//! election whenever the scope is cancelled.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rhythm::api;
use rhythm::config::Config;
use rhythm::coordinator::Coordinator;
use rhythm::mesos;
use rhythm::secrets;
use rhythm::store::{Store, ZkStore};

const SCHEDULER_ELECTION_DIR: &str = "election/mesos_scheduler";
const TASKS_CLEANUP_ELECTION_DIR: &str = "election/tasks_cleanup";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("RHYTHM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rhythm");

    let config = Config::from_env()?;
    info!(
        api_addr = %config.api_addr,
        zookeeper = %config.zookeeper.cluster(),
        mesos = ?config.mesos.addrs,
        role = %config.mesos.role,
        "Configuration loaded"
    );

    let zk_store = Arc::new(ZkStore::connect(&config.zookeeper, config.task_ttl).await?);
    let cleanup_coordinator =
        Coordinator::connect(&config.zookeeper, TASKS_CLEANUP_ELECTION_DIR).await?;
    Arc::clone(&zk_store).spawn_history_gc(cleanup_coordinator);
    let store: Arc<dyn Store> = zk_store;

    let secrets: Arc<dyn secrets::Secrets> = secrets::new(&config.secrets).into();

    let api_state = api::AppState::new(Arc::clone(&store));
    let api_addr = config.api_addr;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_addr, api_state).await {
            error!(error = %e, "API server failed");
        }
    });

    let coordinator = Coordinator::connect(&config.zookeeper, SCHEDULER_ELECTION_DIR).await?;

    loop {
        info!("Waiting until leader");
        let scope = match coordinator.wait_until_leader().await {
            Ok(scope) => scope,
            Err(e) => {
                error!(error = %e, "Leader election failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        tokio::select! {
            result = mesos::run_framework(&config, Arc::clone(&store), Arc::clone(&secrets), scope.clone()) => {
                match result {
                    Ok(()) => info!("Framework session ended"),
                    Err(e) => error!(error = %e, "Framework session failed"),
                }
                scope.cancel();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                coordinator.step_down().await;
                return Ok(());
            }
        }
    }
}
