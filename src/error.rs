//! Error taxonomy for the ingestion and reconciliation core.

use alloy_primitives::B256;
use thiserror::Error;

use crate::repository::{ChainId, OperationState};

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Transport failure that survived every retry attempt.
    #[error("{chain} RPC failed after {attempts} attempts: {message}")]
    Rpc {
        chain: ChainId,
        attempts: usize,
        message: String,
    },

    /// A block previously returned by the client no longer has the same hash.
    #[error("{chain} reorg detected at block {block}")]
    ReorgDetected { chain: ChainId, block: u64 },

    /// Two different logs claim the same leg of one deposit.
    #[error("deposit {deposit_id}: conflicting {chain} leg {conflicting:?}, keeping {existing:?}")]
    DataIntegrity {
        deposit_id: u64,
        chain: ChainId,
        existing: B256,
        conflicting: B256,
    },

    /// A matched pair is missing the gas fields needed for analytics.
    #[error("gas analytics for deposit {deposit_id:?} incomplete: {reason}")]
    Computation {
        deposit_id: Option<u64>,
        reason: String,
    },

    #[error("invalid transition for deposit {deposit_id}: {from} -> {to}")]
    InvalidTransition {
        deposit_id: u64,
        from: OperationState,
        to: OperationState,
    },

    #[error("log decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reconciliation engine stopped")]
    EngineStopped,

    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

impl MonitorError {
    /// Whether the error stems from RPC transport rather than data or logic.
    pub fn is_transport(&self) -> bool {
        matches!(self, MonitorError::Rpc { .. })
    }
}
