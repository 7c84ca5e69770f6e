use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

use crate::error::MonitorError;
use crate::repository::{ChainEvent, ChainId, EventType};

sol! {
    event DepositInitiated(address indexed from, address indexed to, uint256 amount, uint256 indexed depositId, uint256 timestamp);
    event DepositFinalized(address indexed to, uint256 amount, uint256 indexed depositId, uint256 timestamp);
    event WithdrawalInitiated(address indexed from, address indexed to, uint256 amount, uint256 indexed withdrawalId, bytes32 withdrawalHash, uint256 timestamp);
    event WithdrawalFinalized(address indexed to, uint256 amount, bytes32 indexed withdrawalHash, uint256 timestamp);
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Topic0 values the watchers subscribe to.
pub fn watched_topics() -> Vec<B256> {
    vec![
        DepositInitiated::SIGNATURE_HASH,
        DepositFinalized::SIGNATURE_HASH,
        WithdrawalInitiated::SIGNATURE_HASH,
        WithdrawalFinalized::SIGNATURE_HASH,
        Transfer::SIGNATURE_HASH,
    ]
}

struct DecodedFields {
    event_type: EventType,
    from: Address,
    to: Address,
    amount: U256,
    deposit_id: Option<u64>,
    timestamp: Option<U256>,
}

fn decode_err(e: impl std::fmt::Display) -> MonitorError {
    MonitorError::Decode(e.to_string())
}

fn deposit_id(value: U256) -> Result<u64, MonitorError> {
    u64::try_from(value).map_err(|_| MonitorError::Decode(format!("depositId {value} out of range")))
}

fn to_datetime(seconds: U256) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Normalizes one bridge or token log. Returns `Ok(None)` for logs the monitor does not track.
pub fn decode_bridge_log(chain: ChainId, log: &Log) -> Result<Option<ChainEvent>, MonitorError> {
    if log.removed {
        return Ok(None);
    }
    let Some(topic0) = log.topic0().copied() else {
        return Ok(None);
    };

    let topics = log.topics();
    let data = &log.data().data;

    let fields = if topic0 == DepositInitiated::SIGNATURE_HASH {
        let event = DepositInitiated::decode_raw_log(topics, data).map_err(decode_err)?;
        DecodedFields {
            event_type: EventType::Deposit,
            from: event.from,
            to: event.to,
            amount: event.amount,
            deposit_id: Some(deposit_id(event.depositId)?),
            timestamp: Some(event.timestamp),
        }
    } else if topic0 == DepositFinalized::SIGNATURE_HASH {
        let event = DepositFinalized::decode_raw_log(topics, data).map_err(decode_err)?;
        DecodedFields {
            event_type: EventType::Deposit,
            from: log.address(),
            to: event.to,
            amount: event.amount,
            deposit_id: Some(deposit_id(event.depositId)?),
            timestamp: Some(event.timestamp),
        }
    } else if topic0 == WithdrawalInitiated::SIGNATURE_HASH {
        let event = WithdrawalInitiated::decode_raw_log(topics, data).map_err(decode_err)?;
        DecodedFields {
            event_type: EventType::Withdrawal,
            from: event.from,
            to: event.to,
            amount: event.amount,
            deposit_id: None,
            timestamp: Some(event.timestamp),
        }
    } else if topic0 == WithdrawalFinalized::SIGNATURE_HASH {
        let event = WithdrawalFinalized::decode_raw_log(topics, data).map_err(decode_err)?;
        DecodedFields {
            event_type: EventType::Withdrawal,
            from: log.address(),
            to: event.to,
            amount: event.amount,
            deposit_id: None,
            timestamp: Some(event.timestamp),
        }
    } else if topic0 == Transfer::SIGNATURE_HASH {
        let event = Transfer::decode_raw_log(topics, data).map_err(decode_err)?;
        DecodedFields {
            event_type: EventType::Transfer,
            from: event.from,
            to: event.to,
            amount: event.value,
            deposit_id: None,
            timestamp: None,
        }
    } else {
        return Ok(None);
    };

    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| MonitorError::Decode("log without transaction hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| MonitorError::Decode("log without block number".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| MonitorError::Decode("log without log index".to_string()))?;

    let timestamp = fields
        .timestamp
        .and_then(to_datetime)
        .or_else(|| {
            log.block_timestamp
                .and_then(|ts| DateTime::from_timestamp(i64::try_from(ts).ok()?, 0))
        })
        .unwrap_or_else(Utc::now);

    Ok(Some(ChainEvent {
        chain,
        event_type: fields.event_type,
        transaction_hash,
        log_index,
        block_number,
        block_hash: log.block_hash,
        from_address: fields.from,
        to_address: fields.to,
        amount: fields.amount.to_string(),
        deposit_id: fields.deposit_id,
        gas_used: None,
        gas_price_wei: None,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{L2_BRIDGE, deposit_finalized_log, deposit_initiated_log, tx_hash};

    #[test]
    fn test_decode_deposit_initiated() {
        let log = deposit_initiated_log(7, 100, tx_hash(1), 3);
        let event = decode_bridge_log(ChainId::L1, &log).unwrap().unwrap();

        assert_eq!(event.chain, ChainId::L1);
        assert_eq!(event.event_type, EventType::Deposit);
        assert_eq!(event.deposit_id, Some(7));
        assert_eq!(event.block_number, 100);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.amount, "1000000000000000000");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert!(event.gas_used.is_none());
    }

    #[test]
    fn test_decode_deposit_finalized_uses_bridge_as_sender() {
        let log = deposit_finalized_log(7, 55, tx_hash(2), 0);
        let event = decode_bridge_log(ChainId::L2, &log).unwrap().unwrap();

        assert_eq!(event.deposit_id, Some(7));
        assert_eq!(event.from_address, L2_BRIDGE);
    }

    #[test]
    fn test_removed_and_unknown_logs_are_skipped() {
        let mut log = deposit_initiated_log(1, 10, tx_hash(3), 0);
        log.removed = true;
        assert!(decode_bridge_log(ChainId::L1, &log).unwrap().is_none());

        let mut log = deposit_initiated_log(1, 10, tx_hash(3), 0);
        log.inner.data = alloy_primitives::LogData::new_unchecked(vec![B256::repeat_byte(0xee)], Default::default());
        assert!(decode_bridge_log(ChainId::L1, &log).unwrap().is_none());
    }

    #[test]
    fn test_missing_transaction_hash_is_a_decode_error() {
        let mut log = deposit_initiated_log(1, 10, tx_hash(4), 0);
        log.transaction_hash = None;
        assert!(matches!(
            decode_bridge_log(ChainId::L1, &log),
            Err(MonitorError::Decode(_))
        ));
    }
}
