use anyhow::Result;
use bridge_monitor::chain_client::ChainClient;
use bridge_monitor::config::Config;
use bridge_monitor::ingest_worker::{run_ingest_worker, run_timeout_sweeper};
use bridge_monitor::reconciliation::ReconciliationEngine;
use bridge_monitor::repository::{Repository, SqliteRepository};
use bridge_monitor::rpc::AlloyRpc;
use bridge_monitor::signals::{SignalSink, TracingSink};
use bridge_monitor::watcher::EventWatcher;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting bridge monitor");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("L1 bridge: {:?}", config.l1.bridge_address);
    info!("L2 bridge: {:?}", config.l2.bridge_address);

    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open(&config.database_url)?);
    info!("Database initialized");

    let signals: Arc<dyn SignalSink> = Arc::new(TracingSink);
    let engine = Arc::new(ReconciliationEngine::new(
        repository.clone(),
        signals.clone(),
        &config.reconciliation,
    )?);
    let pending = engine.rehydrate_pending()?;
    info!("{} unresolved deposits carried over from the previous run", pending);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for chain_config in [config.l1.clone(), config.l2.clone()] {
        let chain = chain_config.chain;
        let rpc = AlloyRpc::new(&chain_config.rpc_urls)?;
        info!(
            "[{}] RPC URLs: {} endpoint(s) configured",
            chain,
            chain_config.rpc_urls.len()
        );

        let client = Arc::new(ChainClient::new(Arc::new(rpc), &chain_config));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let watcher = EventWatcher::new(
            client,
            repository.clone(),
            signals.clone(),
            tx,
            chain_config,
        );

        // Each chain gets its own worker so a stalled chain never blocks the other.
        tasks.push(tokio::spawn(run_ingest_worker(engine.clone(), rx)));

        let watcher_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = watcher.run(watcher_cancel).await {
                error!("[{}] Watcher error: {}", chain, e);
            }
        }));
    }

    tasks.push(tokio::spawn(run_timeout_sweeper(
        engine.clone(),
        config.reconciliation.sweep_interval,
        cancel.clone(),
    )));

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown requested, waiting up to {:?} for in-flight work",
        config.shutdown_grace
    );
    cancel.cancel();

    match tokio::time::timeout(config.shutdown_grace, futures::future::join_all(tasks)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Task panicked: {}", e);
                }
            }
            info!("Bridge monitor stopped");
        }
        Err(_) => warn!("Grace period elapsed, abandoning remaining tasks"),
    }

    Ok(())
}
