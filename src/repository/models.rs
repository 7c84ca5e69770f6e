use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::MonitorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainId {
    L1,
    L2,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::L1 => "L1",
            ChainId::L2 => "L2",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "L1" => Ok(ChainId::L1),
            "L2" => Ok(ChainId::L2),
            other => Err(anyhow::anyhow!("Unknown chain: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Deposit,
    Withdrawal,
    Transfer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Deposit => "DEPOSIT",
            EventType::Withdrawal => "WITHDRAWAL",
            EventType::Transfer => "TRANSFER",
        }
    }

    /// Operation type label used for gas analytics rows.
    pub fn operation_type(&self) -> &'static str {
        match self {
            EventType::Deposit => "BRIDGE_DEPOSIT",
            EventType::Withdrawal => "BRIDGE_WITHDRAWAL",
            EventType::Transfer => "ERC20_TRANSFER",
        }
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(EventType::Deposit),
            "WITHDRAWAL" => Ok(EventType::Withdrawal),
            "TRANSFER" => Ok(EventType::Transfer),
            other => Err(anyhow::anyhow!("Unknown event type: {}", other)),
        }
    }
}

/// Identity of a single log: the transaction hash plus its log index.
pub type EventKey = (B256, u64);

/// A normalized bridge-relevant log. Immutable once built and shared as `Arc<ChainEvent>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: ChainId,
    pub event_type: EventType,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub from_address: Address,
    pub to_address: Address,
    /// Decimal string, never truncated to a machine integer.
    pub amount: String,
    pub deposit_id: Option<u64>,
    pub gas_used: Option<u64>,
    pub gas_price_wei: Option<u128>,
    pub timestamp: DateTime<Utc>,
}

impl ChainEvent {
    pub fn key(&self) -> EventKey {
        (self.transaction_hash, self.log_index)
    }

    pub fn gas_cost_wei(&self) -> Option<U256> {
        let gas_used = self.gas_used?;
        let gas_price = self.gas_price_wei?;
        U256::from(gas_used).checked_mul(U256::from(gas_price))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    AwaitingL1,
    AwaitingL2,
    Matched,
    TimedOut,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::AwaitingL1 => "AWAITING_L1",
            OperationState::AwaitingL2 => "AWAITING_L2",
            OperationState::Matched => "MATCHED",
            OperationState::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Matched | OperationState::TimedOut)
    }

    fn rank(&self) -> u8 {
        match self {
            OperationState::AwaitingL1 => 0,
            OperationState::AwaitingL2 => 1,
            OperationState::Matched | OperationState::TimedOut => 2,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AWAITING_L1" => Ok(OperationState::AwaitingL1),
            "AWAITING_L2" => Ok(OperationState::AwaitingL2),
            "MATCHED" => Ok(OperationState::Matched),
            "TIMED_OUT" => Ok(OperationState::TimedOut),
            other => Err(anyhow::anyhow!("Unknown operation state: {}", other)),
        }
    }
}

/// One cross-chain deposit tracked from its L1 leg to its L2 credit.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub deposit_id: u64,
    pub l1_event: Option<Arc<ChainEvent>>,
    pub l2_event: Option<Arc<ChainEvent>>,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub timeout_deadline: Option<DateTime<Utc>>,
    pub retraction_count: u32,
}

impl PendingOperation {
    pub fn new(deposit_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            deposit_id,
            l1_event: None,
            l2_event: None,
            state: OperationState::AwaitingL1,
            created_at: now,
            last_updated_at: now,
            timeout_deadline: None,
            retraction_count: 0,
        }
    }

    pub fn leg(&self, chain: ChainId) -> Option<&Arc<ChainEvent>> {
        match chain {
            ChainId::L1 => self.l1_event.as_ref(),
            ChainId::L2 => self.l2_event.as_ref(),
        }
    }

    /// Forward transition. Never leaves a terminal state and never lowers the state rank.
    pub fn advance(&mut self, next: OperationState, now: DateTime<Utc>) -> Result<(), MonitorError> {
        let allowed = if self.state.is_terminal() {
            next == self.state
        } else {
            next.rank() >= self.state.rank()
        };
        if !allowed {
            return Err(MonitorError::InvalidTransition {
                deposit_id: self.deposit_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_updated_at = now;
        Ok(())
    }

    /// The single backward transition, taken only when a reorg removed one of the legs.
    pub fn rewind(&mut self, next: OperationState, now: DateTime<Utc>) -> Result<(), MonitorError> {
        if next.is_terminal() || next.rank() > self.state.rank() {
            return Err(MonitorError::InvalidTransition {
                deposit_id: self.deposit_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.retraction_count += 1;
        self.last_updated_at = now;
        Ok(())
    }

    pub fn start_timeout(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.timeout_deadline = Some(now + timeout);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == OperationState::AwaitingL2
            && self.timeout_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Idempotence key for the analytics record derived from this pair.
    pub fn pair_key(&self) -> Option<String> {
        match (&self.l1_event, &self.l2_event) {
            (Some(l1), Some(l2)) => Some(pair_key(l1, l2)),
            _ => None,
        }
    }
}

pub fn pair_key(l1: &ChainEvent, l2: &ChainEvent) -> String {
    format!("{:?}:{:?}", l1.transaction_hash, l2.transaction_hash)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsStatus {
    Complete,
    Incomplete,
    Retracted,
}

impl AnalyticsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsStatus::Complete => "COMPLETE",
            AnalyticsStatus::Incomplete => "INCOMPLETE",
            AnalyticsStatus::Retracted => "RETRACTED",
        }
    }
}

impl FromStr for AnalyticsStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "COMPLETE" => Ok(AnalyticsStatus::Complete),
            "INCOMPLETE" => Ok(AnalyticsStatus::Incomplete),
            "RETRACTED" => Ok(AnalyticsStatus::Retracted),
            other => Err(anyhow::anyhow!("Unknown analytics status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GasAnalyticsRecord {
    pub pair_key: String,
    pub deposit_id: Option<u64>,
    pub operation_type: String,
    pub l1_gas_cost_wei: Option<U256>,
    pub l2_gas_cost_wei: Option<U256>,
    pub l1_gas_cost_eth: Option<String>,
    pub l2_gas_cost_eth: Option<String>,
    /// `None` when the L1 cost is zero or either leg lacks gas data.
    pub savings_percentage: Option<f64>,
    pub status: AnalyticsStatus,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}
