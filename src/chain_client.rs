//! Reorg-aware, retrying access to one chain's bridge logs.
//!
//! The client remembers the hash of every block it has returned events for (plus the tail
//! of each fetched range). Before serving the next range it re-checks those hashes; a
//! mismatch surfaces as [`MonitorError::ReorgDetected`] at the lowest changed height and
//! the caller decides how far to rewind.

use alloy_primitives::{Address, B256};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::error::MonitorError;
use crate::events::{decode_bridge_log, watched_topics};
use crate::repository::{ChainEvent, ChainId};
use crate::rpc::ChainRpc;

pub struct ChainClient {
    chain: ChainId,
    rpc: Arc<dyn ChainRpc>,
    contracts: Vec<Address>,
    topics: Vec<B256>,
    confirmation_lag: u64,
    max_retries: usize,
    retry_base_delay_ms: u64,
    reorg_tracking_depth: usize,
    observed: Mutex<BTreeMap<u64, B256>>,
}

impl ChainClient {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: &ChainConfig) -> Self {
        Self {
            chain: config.chain,
            rpc,
            contracts: config.contracts(),
            topics: watched_topics(),
            confirmation_lag: config.confirmation_lag,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            reorg_tracking_depth: config.reorg_tracking_depth.max(1),
            observed: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn confirmation_lag(&self) -> u64 {
        self.confirmation_lag
    }

    pub fn endpoint(&self) -> String {
        self.rpc.endpoint()
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.retry_base_delay_ms.max(1))
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    async fn with_retry<T, F, Fut>(&self, method: &str, mut action: F) -> Result<T, MonitorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = 0usize;
        let result = Retry::spawn(self.get_retry_strategy(), || {
            attempts += 1;
            action()
        })
        .await;

        result.map_err(|e| MonitorError::Rpc {
            chain: self.chain,
            attempts,
            message: format!("{method}: {e}"),
        })
    }

    pub async fn current_head(&self) -> Result<u64, MonitorError> {
        self.with_retry("eth_blockNumber", || self.rpc.block_number())
            .await
    }

    /// Highest block considered final: head minus the confirmation lag.
    pub async fn safe_head(&self) -> Result<u64, MonitorError> {
        Ok(self
            .current_head()
            .await?
            .saturating_sub(self.confirmation_lag))
    }

    pub async fn block_hash(&self, number: u64) -> Result<Option<B256>, MonitorError> {
        self.with_retry("eth_getBlockByNumber", || self.rpc.block_hash(number))
            .await
    }

    pub async fn has_code_at(&self, address: Address, block_number: u64) -> Result<bool, MonitorError> {
        let code = self
            .with_retry("eth_getCode", || self.rpc.code_at(address, block_number))
            .await?;
        Ok(!code.is_empty())
    }

    /// Returns the decoded events of `[from_block, to_block]`, ordered by block and log index.
    pub async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, MonitorError> {
        self.verify_observed().await?;

        let logs = self
            .with_retry("eth_getLogs", || {
                self.rpc
                    .logs(from_block, to_block, &self.contracts, &self.topics)
            })
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_bridge_log(self.chain, log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(
                    "[{}] Quarantining undecodable log in tx {:?}: {}",
                    self.chain, log.transaction_hash, e
                ),
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        self.attach_gas(&mut events).await?;

        let mut checkpoints: BTreeMap<u64, B256> = events
            .iter()
            .filter_map(|e| e.block_hash.map(|hash| (e.block_number, hash)))
            .collect();
        if let Some(tail_hash) = self.block_hash(to_block).await? {
            checkpoints.insert(to_block, tail_hash);
        }
        self.record_observed(checkpoints);

        Ok(events)
    }

    /// Drops tracked hashes at or above `block`, after the caller rewound past them.
    pub fn forget_from(&self, block: u64) {
        let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        observed.retain(|number, _| *number < block);
    }

    async fn verify_observed(&self) -> Result<(), MonitorError> {
        let snapshot: Vec<(u64, B256)> = {
            let observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
            observed.iter().map(|(n, h)| (*n, *h)).collect()
        };
        let Some(&(tip, tip_hash)) = snapshot.last() else {
            return Ok(());
        };

        // Hashes chain back to their parents, so an unchanged tip vouches for everything below it.
        if self.block_hash(tip).await? == Some(tip_hash) {
            return Ok(());
        }

        for (number, expected) in snapshot {
            if self.block_hash(number).await? != Some(expected) {
                warn!(
                    "[{}] Block {} hash changed (was {:?})",
                    self.chain, number, expected
                );
                return Err(MonitorError::ReorgDetected {
                    chain: self.chain,
                    block: number,
                });
            }
        }

        Err(MonitorError::ReorgDetected {
            chain: self.chain,
            block: tip,
        })
    }

    fn record_observed(&self, checkpoints: BTreeMap<u64, B256>) {
        let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        observed.extend(checkpoints);
        while observed.len() > self.reorg_tracking_depth {
            observed.pop_first();
        }
    }

    async fn attach_gas(&self, events: &mut [ChainEvent]) -> Result<(), MonitorError> {
        let hashes: HashSet<B256> = events.iter().map(|e| e.transaction_hash).collect();

        for tx_hash in hashes {
            let receipt = self
                .with_retry("eth_getTransactionReceipt", || self.rpc.receipt_gas(tx_hash))
                .await?;

            match receipt {
                Some(receipt) => {
                    for event in events.iter_mut().filter(|e| e.transaction_hash == tx_hash) {
                        event.gas_used = Some(receipt.gas_used);
                        event.gas_price_wei = Some(receipt.effective_gas_price);
                    }
                }
                None => debug!("[{}] No receipt yet for {:?}", self.chain, tx_hash),
            }
        }

        Ok(())
    }
}
