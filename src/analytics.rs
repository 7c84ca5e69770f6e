//! Gas-cost comparison between the two legs of a matched deposit.

use alloy_primitives::U256;
use alloy_primitives::utils::format_ether;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MonitorError;
use crate::repository::{AnalyticsStatus, ChainEvent, GasAnalyticsRecord, Repository, pair_key};

// Savings are computed in millionths of the L1 cost, i.e. four decimals of a percent.
const SAVINGS_SCALE: u64 = 1_000_000;

pub struct GasAnalyticsAggregator {
    repository: Arc<dyn Repository>,
}

impl GasAnalyticsAggregator {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Builds the record for a matched pair without storing it.
    pub fn compute(
        l1_event: &ChainEvent,
        l2_event: &ChainEvent,
    ) -> Result<GasAnalyticsRecord, MonitorError> {
        let l1_cost = leg_cost(l1_event, "L1")?;
        let l2_cost = leg_cost(l2_event, "L2")?;

        Ok(GasAnalyticsRecord {
            pair_key: pair_key(l1_event, l2_event),
            deposit_id: l1_event.deposit_id,
            operation_type: l1_event.event_type.operation_type().to_string(),
            l1_gas_cost_wei: Some(l1_cost),
            l2_gas_cost_wei: Some(l2_cost),
            l1_gas_cost_eth: Some(format_ether(l1_cost)),
            l2_gas_cost_eth: Some(format_ether(l2_cost)),
            savings_percentage: savings_percentage(l1_cost, l2_cost),
            status: AnalyticsStatus::Complete,
            note: None,
            timestamp: l2_event.timestamp,
        })
    }

    /// Stores the analytics record for a matched pair.
    ///
    /// Re-processing the same pair overwrites its row instead of adding one. When either leg
    /// lacks gas data an `INCOMPLETE` record is stored and the computation error is returned.
    pub fn on_matched(
        &self,
        l1_event: &ChainEvent,
        l2_event: &ChainEvent,
    ) -> Result<GasAnalyticsRecord, MonitorError> {
        match Self::compute(l1_event, l2_event) {
            Ok(record) => {
                let inserted = self.repository.save_analytics(&record)?;
                if inserted {
                    info!(
                        "Recorded gas analytics for deposit {:?}: L1 {} ETH, L2 {} ETH, savings {}",
                        record.deposit_id,
                        record.l1_gas_cost_eth.as_deref().unwrap_or("-"),
                        record.l2_gas_cost_eth.as_deref().unwrap_or("-"),
                        record
                            .savings_percentage
                            .map(|s| format!("{s:.2}%"))
                            .unwrap_or_else(|| "n/a".to_string())
                    );
                }
                Ok(record)
            }
            Err(MonitorError::Computation { deposit_id, reason }) => {
                warn!(
                    "Storing incomplete analytics for deposit {:?}: {}",
                    deposit_id, reason
                );
                self.repository
                    .save_analytics(&Self::incomplete(l1_event, l2_event, &reason))?;
                Err(MonitorError::Computation { deposit_id, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Flags the stored record of a pair whose leg was removed by a reorg.
    pub fn retract(&self, pair_key: &str) -> Result<bool, MonitorError> {
        let flagged = self.repository.flag_analytics(
            pair_key,
            AnalyticsStatus::Retracted,
            "leg removed by chain reorganization",
        )?;
        Ok(flagged)
    }

    fn incomplete(l1_event: &ChainEvent, l2_event: &ChainEvent, reason: &str) -> GasAnalyticsRecord {
        let l1_cost = l1_event.gas_cost_wei();
        let l2_cost = l2_event.gas_cost_wei();
        GasAnalyticsRecord {
            pair_key: pair_key(l1_event, l2_event),
            deposit_id: l1_event.deposit_id,
            operation_type: l1_event.event_type.operation_type().to_string(),
            l1_gas_cost_wei: l1_cost,
            l2_gas_cost_wei: l2_cost,
            l1_gas_cost_eth: l1_cost.map(format_ether),
            l2_gas_cost_eth: l2_cost.map(format_ether),
            savings_percentage: None,
            status: AnalyticsStatus::Incomplete,
            note: Some(reason.to_string()),
            timestamp: l2_event.timestamp,
        }
    }
}

fn leg_cost(event: &ChainEvent, leg: &str) -> Result<U256, MonitorError> {
    let missing = match (event.gas_used, event.gas_price_wei) {
        (Some(_), Some(_)) => None,
        (None, Some(_)) => Some("gasUsed"),
        (Some(_), None) => Some("gasPriceWei"),
        (None, None) => Some("gasUsed and gasPriceWei"),
    };
    if let Some(missing) = missing {
        return Err(MonitorError::Computation {
            deposit_id: event.deposit_id,
            reason: format!("{leg} leg {:?} lacks {missing}", event.transaction_hash),
        });
    }

    event.gas_cost_wei().ok_or_else(|| MonitorError::Computation {
        deposit_id: event.deposit_id,
        reason: format!("{leg} leg {:?} gas cost overflows", event.transaction_hash),
    })
}

/// `(l1 - l2) / l1 * 100`, negative when L2 was the more expensive leg.
/// `None` when the L1 cost is zero.
fn savings_percentage(l1_cost: U256, l2_cost: U256) -> Option<f64> {
    if l1_cost.is_zero() {
        return None;
    }

    let scale = U256::from(SAVINGS_SCALE);
    let (delta, negative) = if l1_cost >= l2_cost {
        (l1_cost - l2_cost, false)
    } else {
        (l2_cost - l1_cost, true)
    };
    let scaled = delta.checked_mul(scale)? / l1_cost;
    let magnitude = u128::try_from(scaled).ok()? as f64 * 100.0 / SAVINGS_SCALE as f64;

    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;
    use crate::test_utils::{l1_deposit_event, l2_credit_event, memory_repository};

    fn stored_count(repo: &SqliteRepository) -> usize {
        repo.with_conn(|conn| crate::repository::AnalyticsRepository::new(conn).count())
            .unwrap()
    }

    #[test]
    fn test_savings_for_cheap_l2_credit() {
        let record =
            GasAnalyticsAggregator::compute(&l1_deposit_event(7, 100, 0x07), &l2_credit_event(7, 40, 0x17))
                .unwrap();

        assert_eq!(record.l1_gas_cost_wei, Some(U256::from(1_050_000_000_000_000u64)));
        assert_eq!(record.l2_gas_cost_wei, Some(U256::from(5_000_000_000_000u64)));
        assert_eq!(record.l1_gas_cost_eth.as_deref(), Some("0.001050000000000000"));
        assert_eq!(record.operation_type, "BRIDGE_DEPOSIT");
        let savings = record.savings_percentage.unwrap();
        assert!((savings - 99.52).abs() < 0.01, "savings was {savings}");
    }

    #[test]
    fn test_zero_l1_cost_is_not_applicable() {
        let mut l1 = l1_deposit_event(1, 100, 0x01);
        l1.gas_price_wei = Some(0);

        let record = GasAnalyticsAggregator::compute(&l1, &l2_credit_event(1, 40, 0x11)).unwrap();
        assert_eq!(record.savings_percentage, None);
        assert_eq!(record.status, AnalyticsStatus::Complete);
    }

    #[test]
    fn test_expensive_l2_gives_negative_savings() {
        assert_eq!(savings_percentage(U256::from(100), U256::from(150)), Some(-50.0));
        assert_eq!(savings_percentage(U256::from(100), U256::from(100)), Some(0.0));
    }

    #[test]
    fn test_same_pair_twice_stores_one_record() {
        let repo = memory_repository();
        let aggregator = GasAnalyticsAggregator::new(repo.clone());
        let l1 = l1_deposit_event(7, 100, 0x07);
        let l2 = l2_credit_event(7, 40, 0x17);

        let first = aggregator.on_matched(&l1, &l2).unwrap();
        let second = aggregator.on_matched(&l1, &l2).unwrap();

        assert_eq!(first, second);
        assert_eq!(stored_count(&repo), 1);
    }

    #[test]
    fn test_missing_gas_stores_incomplete_record() {
        let repo = memory_repository();
        let aggregator = GasAnalyticsAggregator::new(repo.clone());
        let l1 = l1_deposit_event(4, 100, 0x04);
        let mut l2 = l2_credit_event(4, 40, 0x14);
        l2.gas_used = None;

        let err = aggregator.on_matched(&l1, &l2).unwrap_err();
        assert!(matches!(err, MonitorError::Computation { deposit_id: Some(4), .. }));

        let stored = repo
            .with_conn(|conn| {
                crate::repository::AnalyticsRepository::new(conn).find(&pair_key(&l1, &l2))
            })
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AnalyticsStatus::Incomplete);
        assert!(stored.l1_gas_cost_wei.is_some());
        assert_eq!(stored.l2_gas_cost_wei, None);
    }

    #[test]
    fn test_retract_flags_stored_record() {
        let repo = memory_repository();
        let aggregator = GasAnalyticsAggregator::new(repo.clone());
        let record = aggregator
            .on_matched(&l1_deposit_event(5, 100, 0x05), &l2_credit_event(5, 40, 0x15))
            .unwrap();

        assert!(aggregator.retract(&record.pair_key).unwrap());
        assert!(!aggregator.retract("unknown").unwrap());
    }
}
