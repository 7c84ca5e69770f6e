//! Per-chain polling loop: confirmed blocks in, ordered event batches out.
//!
//! A batch is sent to the reconciliation side together with a oneshot acknowledgement and the
//! cursor is persisted only once that acknowledgement arrives. A crash in between re-emits the
//! batch on restart; it never skips it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain_client::ChainClient;
use crate::config::ChainConfig;
use crate::deployment::find_deployment_block;
use crate::error::MonitorError;
use crate::repository::{ChainEvent, ChainId, EventKey, Repository};
use crate::signals::{Signal, SignalSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Polling,
    Emitting,
    ReorgRecovery,
    /// RPC retries exhausted; polling is retried on each tick but nothing is emitted.
    Degraded,
}

#[derive(Debug)]
pub enum ChainPayload {
    Events(Vec<Arc<ChainEvent>>),
    /// Everything previously emitted at or above `from_block` may no longer exist.
    Reorg { from_block: u64 },
}

#[derive(Debug)]
pub struct ChainMessage {
    pub chain: ChainId,
    pub payload: ChainPayload,
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    UpToDate,
    Advanced {
        from: u64,
        to: u64,
        emitted: usize,
        caught_up: bool,
    },
    Rewound {
        affected_block: u64,
        cursor: u64,
    },
}

pub struct EventWatcher {
    chain: ChainId,
    client: Arc<ChainClient>,
    repository: Arc<dyn Repository>,
    signals: Arc<dyn SignalSink>,
    sender: mpsc::Sender<ChainMessage>,
    config: ChainConfig,
    state: WatcherState,
    healthy: bool,
    cursor: Option<u64>,
    emitted: BTreeMap<u64, HashSet<EventKey>>,
}

impl EventWatcher {
    pub fn new(
        client: Arc<ChainClient>,
        repository: Arc<dyn Repository>,
        signals: Arc<dyn SignalSink>,
        sender: mpsc::Sender<ChainMessage>,
        config: ChainConfig,
    ) -> Self {
        Self {
            chain: config.chain,
            client,
            repository,
            signals,
            sender,
            config,
            state: WatcherState::Idle,
            healthy: true,
            cursor: None,
            emitted: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Last block whose events have been acknowledged downstream.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Resolves the starting cursor: the persisted one, else the block before the configured
    /// start block, else the block before the bridge deployment.
    pub async fn initialize(&mut self) -> Result<u64, MonitorError> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }

        let cursor = if let Some(block) = self.repository.load_cursor(self.chain)? {
            info!("[{}] Resuming from persisted cursor {}", self.chain, block);
            block
        } else if let Some(start) = self.config.start_block {
            info!("[{}] Starting from configured block {}", self.chain, start);
            start.saturating_sub(1)
        } else {
            let head = self.client.current_head().await?;
            let deployed =
                find_deployment_block(&self.client, self.config.bridge_address, head).await?;
            deployed.saturating_sub(1)
        };

        self.cursor = Some(cursor);
        Ok(cursor)
    }

    /// One fetch-and-emit step over at most `batch_size` confirmed blocks.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, MonitorError> {
        self.state = WatcherState::Polling;
        let cursor = self.initialize().await?;

        let safe_head = self.client.safe_head().await?;
        if safe_head <= cursor {
            debug!(
                "[{}] Safe head {} not past cursor {}",
                self.chain, safe_head, cursor
            );
            self.state = WatcherState::Idle;
            return Ok(PollOutcome::UpToDate);
        }

        let from = cursor + 1;
        let to = safe_head.min(cursor.saturating_add(self.config.batch_size));
        debug!("[{}] Fetching events for blocks {} to {}", self.chain, from, to);

        let events = match self.client.fetch_events(from, to).await {
            Ok(events) => events,
            Err(MonitorError::ReorgDetected { block, .. }) => {
                return self.recover_from_reorg(block, cursor).await;
            }
            Err(e) => return Err(e),
        };

        self.state = WatcherState::Emitting;
        let fresh: Vec<Arc<ChainEvent>> = events
            .into_iter()
            .filter(|e| !self.already_emitted(e))
            .map(Arc::new)
            .collect();
        let emitted = fresh.len();
        let keys: Vec<(u64, EventKey)> = fresh.iter().map(|e| (e.block_number, e.key())).collect();

        if !fresh.is_empty() {
            self.send(ChainPayload::Events(fresh)).await?;
        }

        for (block, key) in keys {
            self.emitted.entry(block).or_default().insert(key);
        }
        self.repository.save_cursor(self.chain, to)?;
        self.cursor = Some(to);
        self.prune_emitted(to);

        info!(
            "[{}] Processed blocks {} to {}: {} new events",
            self.chain, from, to, emitted
        );
        self.state = WatcherState::Idle;

        Ok(PollOutcome::Advanced {
            from,
            to,
            emitted,
            caught_up: to == safe_head,
        })
    }

    /// Handles one timer tick: polls until caught up, tracking health transitions.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        loop {
            match self.poll_once().await {
                Ok(PollOutcome::Advanced {
                    caught_up: false, ..
                })
                | Ok(PollOutcome::Rewound { .. }) => {
                    self.mark_healthy();
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                }
                Ok(_) => {
                    self.mark_healthy();
                    return Ok(());
                }
                Err(MonitorError::EngineStopped) => return Err(MonitorError::EngineStopped),
                Err(e) if e.is_transport() => {
                    self.mark_degraded(e.to_string());
                    return Ok(());
                }
                Err(e) => {
                    warn!("[{}] Poll failed, retrying next tick: {}", self.chain, e);
                    self.state = WatcherState::Idle;
                    return Ok(());
                }
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), MonitorError> {
        info!(
            "[{}] Watcher started against {} (lag {}, poll every {:?})",
            self.chain,
            self.client.endpoint(),
            self.client.confirmation_lag(),
            self.config.poll_interval
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[{}] Watcher cancelled at cursor {:?}", self.chain, self.cursor);
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.tick(&cancel).await {
                error!("[{}] Watcher stopping: {}", self.chain, e);
                return Err(e);
            }
        }
    }

    async fn recover_from_reorg(
        &mut self,
        affected_block: u64,
        cursor: u64,
    ) -> Result<PollOutcome, MonitorError> {
        self.state = WatcherState::ReorgRecovery;
        let rewound = affected_block
            .saturating_sub(self.client.confirmation_lag())
            .min(cursor);
        warn!(
            "[{}] Reorg at block {}, rewinding cursor from {} to {}",
            self.chain, affected_block, cursor, rewound
        );

        // Checkpoints stay until the engine applied the reorg, so an unacknowledged
        // reorg is detected again on the next poll.
        self.send(ChainPayload::Reorg {
            from_block: affected_block,
        })
        .await?;

        self.client.forget_from(rewound + 1);
        self.emitted.retain(|block, _| *block < affected_block);
        self.cursor = Some(rewound);
        self.repository.save_cursor(self.chain, rewound)?;
        self.state = WatcherState::Polling;

        Ok(PollOutcome::Rewound {
            affected_block,
            cursor: rewound,
        })
    }

    async fn send(&self, payload: ChainPayload) -> Result<(), MonitorError> {
        let (ack, acked) = oneshot::channel();
        self.sender
            .send(ChainMessage {
                chain: self.chain,
                payload,
                ack,
            })
            .await
            .map_err(|_| MonitorError::EngineStopped)?;

        acked.await.map_err(|_| {
            MonitorError::Repository(anyhow::anyhow!(
                "{} batch was not acknowledged by the engine",
                self.chain
            ))
        })
    }

    fn already_emitted(&self, event: &ChainEvent) -> bool {
        self.emitted
            .get(&event.block_number)
            .is_some_and(|keys| keys.contains(&event.key()))
    }

    // Only the range a reorg rewind can reach again needs deduplication.
    fn prune_emitted(&mut self, cursor: u64) {
        let window = self
            .config
            .batch_size
            .saturating_add(self.client.confirmation_lag());
        let keep_from = cursor.saturating_sub(window);
        self.emitted = self.emitted.split_off(&keep_from);
    }

    fn mark_degraded(&mut self, reason: String) {
        if self.healthy {
            self.signals.emit(Signal::HealthDegraded {
                chain: self.chain,
                reason,
            });
            self.healthy = false;
        }
        self.state = WatcherState::Degraded;
    }

    fn mark_healthy(&mut self) {
        if !self.healthy {
            self.signals.emit(Signal::HealthRestored { chain: self.chain });
            self.healthy = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        MockRpc, RecordingSink, chain_config, deposit_initiated_log, memory_repository, tx_hash,
    };

    struct Harness {
        rpc: Arc<MockRpc>,
        repo: Arc<crate::repository::SqliteRepository>,
        sink: Arc<RecordingSink>,
        rx: mpsc::Receiver<ChainMessage>,
        watcher: EventWatcher,
    }

    fn harness(config: ChainConfig) -> Harness {
        let rpc = Arc::new(MockRpc::default());
        let repo = memory_repository();
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(8);
        let client = Arc::new(ChainClient::new(rpc.clone(), &config));
        let watcher = EventWatcher::new(client, repo.clone(), sink.clone(), tx, config);
        Harness {
            rpc,
            repo,
            sink,
            rx,
            watcher,
        }
    }

    /// Acknowledges the next message and returns its payload.
    async fn ack_next(rx: &mut mpsc::Receiver<ChainMessage>) -> ChainPayload {
        let ChainMessage { payload, ack, .. } = rx.recv().await.unwrap();
        ack.send(()).unwrap();
        payload
    }

    fn deposit_ids(payload: &ChainPayload) -> Vec<u64> {
        match payload {
            ChainPayload::Events(events) => events.iter().filter_map(|e| e.deposit_id).collect(),
            ChainPayload::Reorg { .. } => panic!("expected events"),
        }
    }

    #[tokio::test]
    async fn test_initialize_prefers_persisted_cursor() {
        let mut h = harness(chain_config(ChainId::L1));
        h.repo.save_cursor(ChainId::L1, 500).unwrap();
        assert_eq!(h.watcher.initialize().await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_initialize_discovers_deployment_block() {
        let mut config = chain_config(ChainId::L1);
        config.start_block = None;
        let mut h = harness(config);
        h.rpc.set_head(1_000);
        h.rpc.set_deployed_at(250);

        assert_eq!(h.watcher.initialize().await.unwrap(), 249);
    }

    #[tokio::test]
    async fn test_poll_emits_then_persists_cursor() {
        let mut h = harness(chain_config(ChainId::L1));
        h.rpc.set_head(120);
        h.rpc.push_log(deposit_initiated_log(1, 50, tx_hash(1), 0));
        h.rpc.push_log(deposit_initiated_log(2, 110, tx_hash(2), 0));
        h.rpc.push_log(deposit_initiated_log(3, 118, tx_hash(3), 0));

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));

        assert_eq!(
            outcome.unwrap(),
            PollOutcome::Advanced {
                from: 1,
                to: 114,
                emitted: 2,
                caught_up: true
            }
        );
        assert_eq!(deposit_ids(&payload), vec![1, 2]);
        assert_eq!(h.repo.load_cursor(ChainId::L1).unwrap(), Some(114));

        assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_unacknowledged_batch_is_emitted_again() {
        let mut h = harness(chain_config(ChainId::L1));
        h.rpc.set_head(120);
        h.rpc.push_log(deposit_initiated_log(1, 50, tx_hash(1), 0));

        let rx = &mut h.rx;
        let dropped = async move {
            drop(rx.recv().await.unwrap());
        };
        let (outcome, _) = tokio::join!(h.watcher.poll_once(), dropped);
        assert!(outcome.is_err());
        assert_eq!(h.repo.load_cursor(ChainId::L1).unwrap(), None);
        assert_eq!(h.watcher.cursor(), Some(0));

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        assert!(outcome.is_ok());
        assert_eq!(deposit_ids(&payload), vec![1]);
    }

    #[tokio::test]
    async fn test_batch_size_caps_each_fetch() {
        let mut config = chain_config(ChainId::L1);
        config.batch_size = 10;
        let mut h = harness(config);
        h.rpc.set_head(36);

        let first = h.watcher.poll_once().await.unwrap();
        assert_eq!(
            first,
            PollOutcome::Advanced {
                from: 1,
                to: 10,
                emitted: 0,
                caught_up: false
            }
        );

        h.watcher.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.watcher.cursor(), Some(30));
    }

    #[tokio::test]
    async fn test_reorg_rewinds_cursor_and_notifies_engine() {
        let mut h = harness(chain_config(ChainId::L1));
        h.rpc.set_head(120);
        h.rpc.push_log(deposit_initiated_log(5, 100, tx_hash(5), 0));

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        outcome.unwrap();
        assert_eq!(deposit_ids(&payload), vec![5]);

        for block in 100..=130 {
            h.rpc.reorg_block(block, 1);
        }
        h.rpc.set_head(130);

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        assert_eq!(
            outcome.unwrap(),
            PollOutcome::Rewound {
                affected_block: 100,
                cursor: 94
            }
        );
        assert!(matches!(payload, ChainPayload::Reorg { from_block: 100 }));
        assert_eq!(h.repo.load_cursor(ChainId::L1).unwrap(), Some(94));

        let outcome = h.watcher.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Advanced {
                from: 95,
                to: 124,
                emitted: 0,
                caught_up: true
            }
        );
    }

    #[tokio::test]
    async fn test_unacknowledged_reorg_is_sent_again() {
        let mut h = harness(chain_config(ChainId::L1));
        h.rpc.set_head(120);
        h.rpc.push_log(deposit_initiated_log(5, 100, tx_hash(5), 0));

        let (outcome, _) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        outcome.unwrap();

        for block in 100..=130 {
            h.rpc.reorg_block(block, 1);
        }
        h.rpc.set_head(130);

        let rx = &mut h.rx;
        let dropped = async move {
            let message = rx.recv().await.unwrap();
            assert!(matches!(message.payload, ChainPayload::Reorg { from_block: 100 }));
        };
        let (outcome, _) = tokio::join!(h.watcher.poll_once(), dropped);
        assert!(matches!(outcome, Err(MonitorError::Repository(_))));
        assert_eq!(h.watcher.cursor(), Some(114));
        assert_eq!(h.repo.load_cursor(ChainId::L1).unwrap(), Some(114));

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        assert_eq!(
            outcome.unwrap(),
            PollOutcome::Rewound {
                affected_block: 100,
                cursor: 94
            }
        );
        assert!(matches!(payload, ChainPayload::Reorg { from_block: 100 }));
        assert_eq!(h.repo.load_cursor(ChainId::L1).unwrap(), Some(94));
    }

    #[tokio::test]
    async fn test_reincluded_event_is_emitted_after_reorg() {
        let mut h = harness(chain_config(ChainId::L1));
        h.rpc.set_head(120);
        h.rpc.push_log(deposit_initiated_log(5, 100, tx_hash(5), 0));

        let (outcome, _) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        outcome.unwrap();

        for block in 100..=130 {
            h.rpc.reorg_block(block, 1);
        }
        h.rpc.set_head(130);
        h.rpc.push_log(deposit_initiated_log(5, 102, tx_hash(5), 0));

        let (outcome, _) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        assert!(matches!(outcome.unwrap(), PollOutcome::Rewound { .. }));

        let (outcome, payload) = tokio::join!(h.watcher.poll_once(), ack_next(&mut h.rx));
        outcome.unwrap();
        assert_eq!(deposit_ids(&payload), vec![5]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_then_recover() {
        let mut h = harness(chain_config(ChainId::L1));
        let cancel = CancellationToken::new();
        h.rpc.fail_next(100);

        h.watcher.tick(&cancel).await.unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Degraded);
        h.watcher.tick(&cancel).await.unwrap();
        assert_eq!(
            h.sink.count(|s| matches!(s, Signal::HealthDegraded { .. })),
            1
        );

        h.rpc.fail_next(0);
        h.watcher.tick(&cancel).await.unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Idle);
        assert_eq!(
            h.sink.count(|s| matches!(s, Signal::HealthRestored { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(chain_config(ChainId::L1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        h.watcher.run(cancel).await.unwrap();
    }
}
