//! Outbound operator signals: health, timeouts, retractions and integrity conflicts.

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::repository::ChainId;

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    HealthDegraded {
        chain: ChainId,
        reason: String,
    },
    HealthRestored {
        chain: ChainId,
    },
    TimeoutAlert {
        deposit_id: u64,
        deadline: DateTime<Utc>,
    },
    Retracted {
        deposit_id: u64,
        chain: ChainId,
        transaction_hash: B256,
        analytics_flagged: bool,
    },
    DataIntegrity {
        deposit_id: u64,
        chain: ChainId,
        existing: B256,
        conflicting: B256,
    },
    AnalyticsIncomplete {
        deposit_id: u64,
        reason: String,
    },
    LateCredit {
        deposit_id: u64,
        transaction_hash: B256,
    },
}

pub trait SignalSink: Send + Sync {
    fn emit(&self, signal: Signal);
}

/// Sink that turns every signal into a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SignalSink for TracingSink {
    fn emit(&self, signal: Signal) {
        match signal {
            Signal::HealthDegraded { chain, reason } => {
                error!("[{}] Health degraded, polling suspended: {}", chain, reason);
            }
            Signal::HealthRestored { chain } => {
                info!("[{}] Health restored, polling resumed", chain);
            }
            Signal::TimeoutAlert { deposit_id, deadline } => {
                warn!(
                    "Deposit {} timed out waiting for L2 credit (deadline {})",
                    deposit_id, deadline
                );
            }
            Signal::Retracted {
                deposit_id,
                chain,
                transaction_hash,
                analytics_flagged,
            } => {
                warn!(
                    "Deposit {} lost its {} leg {:?} to a reorg (analytics flagged: {})",
                    deposit_id, chain, transaction_hash, analytics_flagged
                );
            }
            Signal::DataIntegrity {
                deposit_id,
                chain,
                existing,
                conflicting,
            } => {
                error!(
                    "Deposit {} has conflicting {} events: kept {:?}, rejected {:?}",
                    deposit_id, chain, existing, conflicting
                );
            }
            Signal::AnalyticsIncomplete { deposit_id, reason } => {
                warn!("Analytics for deposit {} incomplete: {}", deposit_id, reason);
            }
            Signal::LateCredit {
                deposit_id,
                transaction_hash,
            } => {
                warn!(
                    "L2 credit {:?} arrived after deposit {} timed out",
                    transaction_hash, deposit_id
                );
            }
        }
    }
}
