//! Shared fixtures for unit tests: a scripted RPC, a capturing signal sink and event builders.

use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, U256, address};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ChainConfig;
use crate::events::{DepositFinalized, DepositInitiated};
use crate::repository::{
    AnalyticsStatus, ChainEvent, ChainId, Database, EventType, GasAnalyticsRecord,
    PendingOperation, Repository, SqliteRepository,
};
use crate::rpc::{ChainRpc, GasReceipt};
use crate::signals::{Signal, SignalSink};

pub const L1_BRIDGE: Address = address!("1111111111111111111111111111111111111111");
pub const L2_BRIDGE: Address = address!("2222222222222222222222222222222222222222");
pub const USER: Address = address!("3333333333333333333333333333333333333333");

pub fn tx_hash(n: u8) -> B256 {
    B256::repeat_byte(n)
}

/// Deterministic block hash; a different `fork` byte models a replaced block.
pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn rpc_log(address: Address, data: alloy_primitives::LogData, block: u64, tx: B256, log_index: u64) -> Log {
    Log {
        inner: alloy_primitives::Log { address, data },
        block_hash: Some(block_hash(block, 0)),
        block_number: Some(block),
        block_timestamp: None,
        transaction_hash: Some(tx),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

pub fn deposit_initiated_log(deposit_id: u64, block: u64, tx: B256, log_index: u64) -> Log {
    let event = DepositInitiated {
        from: USER,
        to: USER,
        amount: U256::from(1_000_000_000_000_000_000u64),
        depositId: U256::from(deposit_id),
        timestamp: U256::from(1_700_000_000u64),
    };
    rpc_log(L1_BRIDGE, event.encode_log_data(), block, tx, log_index)
}

pub fn deposit_finalized_log(deposit_id: u64, block: u64, tx: B256, log_index: u64) -> Log {
    let event = DepositFinalized {
        to: USER,
        amount: U256::from(1_000_000_000_000_000_000u64),
        depositId: U256::from(deposit_id),
        timestamp: U256::from(1_700_000_060u64),
    };
    rpc_log(L2_BRIDGE, event.encode_log_data(), block, tx, log_index)
}

/// L1 deposit leg with 21000 gas at 50 gwei.
pub fn l1_deposit_event(deposit_id: u64, block: u64, tx: u8) -> ChainEvent {
    ChainEvent {
        chain: ChainId::L1,
        event_type: EventType::Deposit,
        transaction_hash: tx_hash(tx),
        log_index: 0,
        block_number: block,
        block_hash: Some(block_hash(block, 0)),
        from_address: USER,
        to_address: USER,
        amount: "1000000000000000000".to_string(),
        deposit_id: Some(deposit_id),
        gas_used: Some(21_000),
        gas_price_wei: Some(50_000_000_000),
        timestamp: fixed_time(),
    }
}

/// L2 credit leg with 5000 gas at 1 gwei.
pub fn l2_credit_event(deposit_id: u64, block: u64, tx: u8) -> ChainEvent {
    ChainEvent {
        chain: ChainId::L2,
        event_type: EventType::Deposit,
        transaction_hash: tx_hash(tx),
        log_index: 0,
        block_number: block,
        block_hash: Some(block_hash(block, 0)),
        from_address: L2_BRIDGE,
        to_address: USER,
        amount: "1000000000000000000".to_string(),
        deposit_id: Some(deposit_id),
        gas_used: Some(5_000),
        gas_price_wei: Some(1_000_000_000),
        timestamp: fixed_time(),
    }
}

/// Small, fast settings: lag 6, three retries at 1ms, a 1000 block batch and genesis at block 0.
pub fn chain_config(chain: ChainId) -> ChainConfig {
    ChainConfig {
        chain,
        rpc_urls: vec!["mock://chain".to_string()],
        bridge_address: match chain {
            ChainId::L1 => L1_BRIDGE,
            ChainId::L2 => L2_BRIDGE,
        },
        token_address: None,
        start_block: Some(0),
        confirmation_lag: 6,
        poll_interval: Duration::from_millis(10),
        batch_size: 1000,
        max_retries: 3,
        retry_base_delay_ms: 1,
        reorg_tracking_depth: 64,
    }
}

pub fn memory_repository() -> Arc<SqliteRepository> {
    Arc::new(SqliteRepository::new(
        Database::new(":memory:").expect("in-memory database"),
    ))
}

/// SQLite repository whose writes can be made to fail a set number of times.
pub struct FlakyRepository {
    pub inner: Arc<SqliteRepository>,
    operation_failures: AtomicUsize,
    analytics_failures: AtomicUsize,
}

impl FlakyRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: memory_repository(),
            operation_failures: AtomicUsize::new(0),
            analytics_failures: AtomicUsize::new(0),
        })
    }

    /// The next `n` calls to `save_operation` fail.
    pub fn fail_operation_saves(&self, n: usize) {
        self.operation_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` analytics writes (`save_analytics` and `flag_analytics`) fail.
    pub fn fail_analytics_writes(&self, n: usize) {
        self.analytics_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize, what: &str) -> Result<()> {
        let failing = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("database is locked ({what})");
        }
        Ok(())
    }
}

impl Repository for FlakyRepository {
    fn save_transaction(&self, event: &ChainEvent) -> Result<()> {
        self.inner.save_transaction(event)
    }

    fn find_by_deposit_id(&self, deposit_id: u64) -> Result<Option<PendingOperation>> {
        self.inner.find_by_deposit_id(deposit_id)
    }

    fn save_operation(&self, operation: &PendingOperation) -> Result<()> {
        Self::take_failure(&self.operation_failures, "save_operation")?;
        self.inner.save_operation(operation)
    }

    fn unresolved_operations(&self) -> Result<Vec<PendingOperation>> {
        self.inner.unresolved_operations()
    }

    fn deposits_since(&self, chain: ChainId, from_block: u64) -> Result<Vec<u64>> {
        self.inner.deposits_since(chain, from_block)
    }

    fn save_analytics(&self, record: &GasAnalyticsRecord) -> Result<bool> {
        Self::take_failure(&self.analytics_failures, "save_analytics")?;
        self.inner.save_analytics(record)
    }

    fn flag_analytics(&self, pair_key: &str, status: AnalyticsStatus, note: &str) -> Result<bool> {
        Self::take_failure(&self.analytics_failures, "flag_analytics")?;
        self.inner.flag_analytics(pair_key, status, note)
    }

    fn load_cursor(&self, chain: ChainId) -> Result<Option<u64>> {
        self.inner.load_cursor(chain)
    }

    fn save_cursor(&self, chain: ChainId, block_number: u64) -> Result<()> {
        self.inner.save_cursor(chain, block_number)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingSink {
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Signal) -> bool) -> usize {
        self.signals.lock().unwrap().iter().filter(|s| predicate(s)).count()
    }
}

impl SignalSink for RecordingSink {
    fn emit(&self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }
}

/// Scripted chain: a movable head, per-height hash overrides, a log set and receipts.
#[derive(Default)]
pub struct MockRpc {
    head: AtomicU64,
    hashes: Mutex<HashMap<u64, B256>>,
    logs: Mutex<Vec<Log>>,
    receipts: Mutex<HashMap<B256, GasReceipt>>,
    failures: AtomicUsize,
    calls: AtomicUsize,
    deployed_at: Mutex<Option<u64>>,
}

impl MockRpc {
    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_receipt(&self, tx: B256, gas_used: u64, effective_gas_price: u128) {
        self.receipts.lock().unwrap().insert(
            tx,
            GasReceipt {
                gas_used,
                effective_gas_price,
            },
        );
    }

    /// Replaces block `number` with an empty sibling.
    pub fn reorg_block(&self, number: u64, fork: u8) {
        self.hashes
            .lock()
            .unwrap()
            .insert(number, block_hash(number, fork));
        self.logs
            .lock()
            .unwrap()
            .retain(|log| log.block_number != Some(number));
    }

    /// The next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_deployed_at(&self, block: u64) {
        *self.deployed_at.lock().unwrap() = Some(block);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset by peer");
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    fn endpoint(&self) -> String {
        "mock://chain".to_string()
    }

    async fn block_number(&self) -> Result<u64> {
        self.check_failure()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>> {
        self.check_failure()?;
        if number > self.head.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let hash = self
            .hashes
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or_else(|| block_hash(number, 0));
        Ok(Some(hash))
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>> {
        self.check_failure()?;
        let logs = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or_default();
                block >= from_block
                    && block <= to_block
                    && (addresses.is_empty() || addresses.contains(&log.address()))
                    && log.topic0().is_some_and(|t| topics.is_empty() || topics.contains(t))
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn receipt_gas(&self, tx_hash: B256) -> Result<Option<GasReceipt>> {
        self.check_failure()?;
        Ok(self.receipts.lock().unwrap().get(&tx_hash).copied())
    }

    async fn code_at(&self, _address: Address, block_number: u64) -> Result<Bytes> {
        self.check_failure()?;
        match *self.deployed_at.lock().unwrap() {
            Some(deployed) if block_number >= deployed => Ok(Bytes::from_static(&[0x60, 0x80])),
            _ => Ok(Bytes::new()),
        }
    }
}
