use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::MonitorError;
use crate::reconciliation::ReconciliationEngine;
use crate::watcher::{ChainMessage, ChainPayload};

/// Drains one watcher queue in order until the watcher side closes it.
pub async fn run_ingest_worker(
    engine: Arc<ReconciliationEngine>,
    mut rx: mpsc::Receiver<ChainMessage>,
) {
    while let Some(message) = rx.recv().await {
        process_message(&engine, message).await;
    }
    info!("Ingest worker stopped: watcher queue closed");
}

/// Applies one message and acknowledges it. Returns whether it was acknowledged.
///
/// Bad records are logged and skipped. A repository failure leaves the message
/// unacknowledged so the watcher keeps its cursor and delivers the batch again.
pub async fn process_message(engine: &ReconciliationEngine, message: ChainMessage) -> bool {
    let ChainMessage {
        chain,
        payload,
        ack,
    } = message;
    let start = Instant::now();

    match payload {
        ChainPayload::Events(events) => {
            let total = events.len();
            for event in events {
                match engine.on_event(event).await {
                    Ok(_) => {}
                    Err(e @ MonitorError::Repository(_)) => {
                        error!("[{}] Storage failure, batch will be redelivered: {}", chain, e);
                        return false;
                    }
                    Err(e) => warn!("[{}] Quarantined event: {}", chain, e),
                }
            }
            info!("[{}] Applied {} events in {:?}", chain, total, start.elapsed());
        }
        ChainPayload::Reorg { from_block } => match engine.on_reorg(chain, from_block).await {
            Ok(retracted) => info!(
                "[{}] Reorg from block {} retracted {} operations",
                chain,
                from_block,
                retracted.len()
            ),
            Err(e) => {
                error!("[{}] Failed to apply reorg from block {}: {}", chain, from_block, e);
                return false;
            }
        },
    }

    // The watcher may have been cancelled while waiting.
    ack.send(()).is_ok()
}

/// Periodically times out deposits whose L2 credit never arrived.
pub async fn run_timeout_sweeper(
    engine: Arc<ReconciliationEngine>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Timeout sweeper stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        if let Err(e) = engine.sweep_timeouts().await {
            error!("Timeout sweep failed: {}", e);
        }
    }
}
