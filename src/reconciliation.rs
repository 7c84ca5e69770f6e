//! Cross-chain correlation of bridge deposits.
//!
//! Each deposit id owns one [`PendingOperation`] guarded by its own async mutex, so the two
//! ingest workers and the timeout sweeper never mutate the same deposit concurrently while
//! different deposits proceed in parallel. The in-memory table is load-through: a miss
//! rehydrates the repository snapshot before any mutation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::analytics::GasAnalyticsAggregator;
use crate::config::ReconciliationConfig;
use crate::error::MonitorError;
use crate::repository::{ChainEvent, ChainId, EventType, OperationState, PendingOperation, Repository};
use crate::signals::{Signal, SignalSink};

type OperationCell = Arc<tokio::sync::Mutex<PendingOperation>>;

/// What a single delivered event did to its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// L1 deposit recorded, waiting for the L2 credit.
    AwaitingL2,
    /// L2 credit recorded before its L1 deposit was seen.
    AwaitingL1,
    Matched,
    /// Already applied; nothing changed.
    Duplicate,
    /// L2 credit for an operation that had already timed out.
    Late,
    /// Persisted but not part of deposit reconciliation.
    Ignored,
}

pub struct ReconciliationEngine {
    repository: Arc<dyn Repository>,
    signals: Arc<dyn SignalSink>,
    analytics: GasAnalyticsAggregator,
    l2_timeout: chrono::Duration,
    terminal_retention: chrono::Duration,
    operations: Mutex<HashMap<u64, OperationCell>>,
}

impl ReconciliationEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        signals: Arc<dyn SignalSink>,
        config: &ReconciliationConfig,
    ) -> Result<Self, MonitorError> {
        let l2_timeout = chrono::Duration::from_std(config.l2_timeout)
            .map_err(|e| MonitorError::Config(format!("L2 timeout out of range: {e}")))?;
        let terminal_retention = chrono::Duration::from_std(config.terminal_retention)
            .map_err(|e| MonitorError::Config(format!("terminal retention out of range: {e}")))?;

        Ok(Self {
            analytics: GasAnalyticsAggregator::new(repository.clone()),
            repository,
            signals,
            l2_timeout,
            terminal_retention,
            operations: Mutex::new(HashMap::new()),
        })
    }

    pub async fn on_event(&self, event: Arc<ChainEvent>) -> Result<Outcome, MonitorError> {
        self.on_event_at(event, Utc::now()).await
    }

    pub async fn on_event_at(
        &self,
        event: Arc<ChainEvent>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, MonitorError> {
        self.repository.save_transaction(&event)?;

        let Some(deposit_id) = event
            .deposit_id
            .filter(|_| event.event_type == EventType::Deposit)
        else {
            debug!(
                "[{}] Stored {} event {:?}",
                event.chain,
                event.event_type.as_str(),
                event.transaction_hash
            );
            return Ok(Outcome::Ignored);
        };

        let cell = self.cell(deposit_id)?;
        let mut operation = cell.lock().await;

        if let Some(existing) = operation.leg(event.chain) {
            if existing.key() == event.key() {
                debug!(
                    "[{}] Duplicate delivery of {:?} for deposit {}",
                    event.chain, event.transaction_hash, deposit_id
                );
                return Ok(Outcome::Duplicate);
            }

            let existing = existing.transaction_hash;
            self.signals.emit(Signal::DataIntegrity {
                deposit_id,
                chain: event.chain,
                existing,
                conflicting: event.transaction_hash,
            });
            return Err(MonitorError::DataIntegrity {
                deposit_id,
                chain: event.chain,
                existing,
                conflicting: event.transaction_hash,
            });
        }

        // Memory changes only once the snapshot is stored.
        let mut updated = operation.clone();
        let state = updated.state;
        let outcome = match event.chain {
            ChainId::L1 => {
                if updated.l2_event.is_some() {
                    updated.advance(OperationState::Matched, now)?;
                    updated.l1_event = Some(event.clone());
                    Outcome::Matched
                } else {
                    updated.advance(OperationState::AwaitingL2, now)?;
                    updated.l1_event = Some(event.clone());
                    updated.start_timeout(now, self.l2_timeout);
                    Outcome::AwaitingL2
                }
            }
            ChainId::L2 => match state {
                OperationState::AwaitingL2 => {
                    updated.advance(OperationState::Matched, now)?;
                    updated.l2_event = Some(event.clone());
                    Outcome::Matched
                }
                OperationState::TimedOut => {
                    updated.l2_event = Some(event.clone());
                    updated.last_updated_at = now;
                    Outcome::Late
                }
                _ => {
                    updated.l2_event = Some(event.clone());
                    updated.last_updated_at = now;
                    Outcome::AwaitingL1
                }
            },
        };

        // The analytics upsert can be replayed, so it goes before the snapshot.
        let mut incomplete = None;
        if outcome == Outcome::Matched {
            if let (Some(l1), Some(l2)) = (&updated.l1_event, &updated.l2_event) {
                match self.analytics.on_matched(l1, l2) {
                    Ok(_) => {}
                    Err(MonitorError::Computation { reason, .. }) => incomplete = Some(reason),
                    Err(e) => return Err(e),
                }
            }
        }

        self.repository.save_operation(&updated)?;
        *operation = updated;

        match outcome {
            Outcome::Matched => {
                info!("Deposit {} matched across L1 and L2", deposit_id);
                if let Some(reason) = incomplete {
                    self.signals
                        .emit(Signal::AnalyticsIncomplete { deposit_id, reason });
                }
            }
            Outcome::AwaitingL2 => info!(
                "Deposit {} initiated on L1 at block {}, awaiting L2 credit",
                deposit_id, event.block_number
            ),
            Outcome::AwaitingL1 => info!(
                "Deposit {} credited on L2 before its L1 deposit was seen",
                deposit_id
            ),
            Outcome::Late => self.signals.emit(Signal::LateCredit {
                deposit_id,
                transaction_hash: event.transaction_hash,
            }),
            _ => {}
        }

        Ok(outcome)
    }

    /// Removes every leg observed on `chain` at or above `from_block` and rewinds the owning
    /// operations. Returns the affected deposit ids.
    ///
    /// Operations already evicted from memory are reloaded first. A failure leaves the
    /// operation untouched, so applying the same reorg again is safe.
    pub async fn on_reorg(&self, chain: ChainId, from_block: u64) -> Result<Vec<u64>, MonitorError> {
        let now = Utc::now();
        let mut retracted = Vec::new();

        for deposit_id in self.repository.deposits_since(chain, from_block)? {
            self.load_cell(deposit_id)?;
        }

        for cell in self.snapshot() {
            let mut operation = cell.lock().await;
            let Some(leg) = operation
                .leg(chain)
                .filter(|e| e.block_number >= from_block)
                .cloned()
            else {
                continue;
            };

            let deposit_id = operation.deposit_id;
            let was_matched = operation.state == OperationState::Matched;
            let pair_key = operation.pair_key();

            let mut updated = operation.clone();
            match chain {
                ChainId::L1 => {
                    updated.rewind(OperationState::AwaitingL1, now)?;
                    updated.l1_event = None;
                    updated.timeout_deadline = None;
                }
                ChainId::L2 => {
                    let state = updated.state;
                    match state {
                        OperationState::Matched => {
                            updated.rewind(OperationState::AwaitingL2, now)?;
                            updated.start_timeout(now, self.l2_timeout);
                        }
                        // A late credit never moved the state, so there is nothing to rewind.
                        OperationState::TimedOut => updated.last_updated_at = now,
                        state => updated.rewind(state, now)?,
                    }
                    updated.l2_event = None;
                }
            }

            let analytics_flagged = match pair_key.filter(|_| was_matched) {
                Some(key) => self.analytics.retract(&key)?,
                None => false,
            };

            self.repository.save_operation(&updated)?;
            *operation = updated;

            warn!(
                "[{}] Reorg from block {} removed leg {:?} of deposit {}, now {}",
                chain, from_block, leg.transaction_hash, deposit_id, operation.state
            );
            self.signals.emit(Signal::Retracted {
                deposit_id,
                chain,
                transaction_hash: leg.transaction_hash,
                analytics_flagged,
            });
            retracted.push(deposit_id);
        }

        retracted.sort_unstable();
        Ok(retracted)
    }

    /// Loads every unresolved operation from the repository so the timeout sweep covers
    /// deposits seen before a restart. Returns how many were loaded.
    pub fn rehydrate_pending(&self) -> Result<usize, MonitorError> {
        let unresolved = self.repository.unresolved_operations()?;
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let before = operations.len();

        for operation in unresolved {
            operations
                .entry(operation.deposit_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(operation)));
        }

        let loaded = operations.len() - before;
        if loaded > 0 {
            info!("Rehydrated {} unresolved deposits", loaded);
        }
        Ok(loaded)
    }

    pub async fn sweep_timeouts(&self) -> Result<Vec<u64>, MonitorError> {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Moves every expired `AWAITING_L2` operation to `TIMED_OUT`, then evicts terminal
    /// operations older than the retention window from memory.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Result<Vec<u64>, MonitorError> {
        let mut expired = Vec::new();

        for cell in self.snapshot() {
            let mut operation = cell.lock().await;
            if !operation.is_expired(now) {
                continue;
            }

            let deadline = operation.timeout_deadline.unwrap_or(now);
            let mut timed_out = operation.clone();
            timed_out.advance(OperationState::TimedOut, now)?;

            if let Err(e) = self.repository.save_operation(&timed_out) {
                warn!(
                    "Failed to persist timeout of deposit {}, retrying next sweep: {}",
                    timed_out.deposit_id, e
                );
                continue;
            }

            *operation = timed_out;
            self.signals.emit(Signal::TimeoutAlert {
                deposit_id: operation.deposit_id,
                deadline,
            });
            expired.push(operation.deposit_id);
        }

        let evicted = self.evict_terminal(now);
        if !expired.is_empty() || evicted > 0 {
            info!(
                "Timeout sweep: {} timed out, {} evicted from memory",
                expired.len(),
                evicted
            );
        }

        expired.sort_unstable();
        Ok(expired)
    }

    /// Current snapshot of a deposit, from memory or from the repository.
    pub async fn operation(&self, deposit_id: u64) -> Result<Option<PendingOperation>, MonitorError> {
        let cell = self
            .operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&deposit_id)
            .cloned();

        match cell {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(self.repository.find_by_deposit_id(deposit_id)?),
        }
    }

    /// Number of operations currently held in memory.
    pub fn tracked(&self) -> usize {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn cell(&self, deposit_id: u64) -> Result<OperationCell, MonitorError> {
        if let Some(cell) = self.load_cell(deposit_id)? {
            return Ok(cell);
        }

        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let cell = operations
            .entry(deposit_id)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(PendingOperation::new(
                    deposit_id,
                    Utc::now(),
                )))
            })
            .clone();
        Ok(cell)
    }

    /// The in-memory cell of a deposit, rehydrated from its snapshot when needed.
    fn load_cell(&self, deposit_id: u64) -> Result<Option<OperationCell>, MonitorError> {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cell) = operations.get(&deposit_id) {
            return Ok(Some(cell.clone()));
        }

        let Some(snapshot) = self.repository.find_by_deposit_id(deposit_id)? else {
            return Ok(None);
        };
        debug!(
            "Rehydrated deposit {} in state {}",
            deposit_id, snapshot.state
        );
        let cell = Arc::new(tokio::sync::Mutex::new(snapshot));
        operations.insert(deposit_id, cell.clone());
        Ok(Some(cell))
    }

    fn snapshot(&self) -> Vec<OperationCell> {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    // Only cells nobody else holds are dropped, so a concurrent mutation never ends up on a
    // second copy of the same deposit.
    fn evict_terminal(&self, now: DateTime<Utc>) -> usize {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let before = operations.len();

        operations.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            match cell.try_lock() {
                Ok(operation) => {
                    !(operation.state.is_terminal()
                        && operation.last_updated_at + self.terminal_retention <= now)
                }
                Err(_) => true,
            }
        });

        before - operations.len()
    }
}
