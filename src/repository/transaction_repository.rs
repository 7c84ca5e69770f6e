use super::models::{ChainEvent, ChainId, EventType};
use super::{format_timestamp, parse_timestamp};
use alloy_primitives::{Address, B256};
use anyhow::Result;
use rusqlite::{Row, ToSql, params, params_from_iter};
use std::str::FromStr;

pub struct TransactionRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TransactionRepository<'a> {
    const UPSERT_TRANSACTION: &'static str = "INSERT OR REPLACE INTO chain_transactions (
            chain, transaction_hash, log_index, event_type, block_number, block_hash,
            from_address, to_address, amount, deposit_id, gas_used, gas_price_wei, timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

    const SELECT_TRANSACTION: &'static str = "SELECT chain, transaction_hash, log_index, event_type, block_number, block_hash, from_address, to_address, amount, deposit_id, gas_used, gas_price_wei, timestamp FROM chain_transactions";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, event: &ChainEvent) -> Result<()> {
        self.conn.execute(
            Self::UPSERT_TRANSACTION,
            params![
                event.chain.as_str(),
                format!("{:?}", event.transaction_hash),
                event.log_index,
                event.event_type.as_str(),
                event.block_number,
                event.block_hash.map(|h| format!("{h:?}")),
                format!("{:?}", event.from_address),
                format!("{:?}", event.to_address),
                event.amount,
                event.deposit_id,
                event.gas_used,
                event.gas_price_wei.map(|p| p.to_string()),
                format_timestamp(&event.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn query_transactions(
        &self,
        chain: Option<ChainId>,
        deposit_id: Option<u64>,
        block_range: Option<(u64, u64)>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChainEvent>> {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(chain) = chain {
            conditions.push("chain = ?");
            params.push(Box::new(chain.as_str()));
        }

        if let Some(id) = deposit_id {
            conditions.push("deposit_id = ?");
            params.push(Box::new(id));
        }

        if let Some((start, end)) = block_range {
            conditions.push("block_number >= ?");
            params.push(Box::new(start));
            conditions.push("block_number <= ?");
            params.push(Box::new(end));
        }

        self.execute_paginated_query(
            conditions,
            params,
            limit,
            offset,
            Some(" ORDER BY block_number DESC, log_index DESC"),
        )
    }

    /// Deposit ids with a deposit leg recorded on `chain` at or above `from_block`.
    pub fn deposit_ids_since(&self, chain: ChainId, from_block: u64) -> Result<Vec<u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT deposit_id FROM chain_transactions
             WHERE chain = ?1 AND block_number >= ?2
               AND event_type = 'DEPOSIT' AND deposit_id IS NOT NULL
             ORDER BY deposit_id",
        )?;
        let ids = stmt
            .query_map(params![chain.as_str(), from_block], |row| row.get(0))?
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(ids)
    }

    pub fn get_statistics(&self) -> Result<TransactionStats> {
        let mut stmt = self.conn.prepare(
            "SELECT chain, COUNT(*), MIN(block_number), MAX(block_number),
                    SUM(CASE WHEN event_type = 'DEPOSIT' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN event_type = 'WITHDRAWAL' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN event_type = 'TRANSFER' THEN 1 ELSE 0 END)
             FROM chain_transactions GROUP BY chain ORDER BY chain",
        )?;
        let chains = stmt
            .query_map([], |row| {
                Ok(ChainStats {
                    chain: row.get(0)?,
                    total: row.get(1)?,
                    earliest_block: row.get(2)?,
                    latest_block: row.get(3)?,
                    deposits: row.get(4)?,
                    withdrawals: row.get(5)?,
                    transfers: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionStats { chains })
    }

    fn execute_paginated_query(
        &self,
        conditions: Vec<&str>,
        params: Vec<Box<dyn ToSql>>,
        limit: usize,
        offset: usize,
        order_by: Option<&str>,
    ) -> Result<Vec<ChainEvent>> {
        let mut query = Self::SELECT_TRANSACTION.to_string();

        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        if let Some(order) = order_by {
            query.push_str(order);
        }

        query.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

        let mut stmt = self.conn.prepare(&query)?;
        let events = stmt
            .query_map(params_from_iter(params), Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<ChainEvent> {
        fn conversion<E: std::error::Error + Send + Sync + 'static>(
            idx: usize,
        ) -> impl FnOnce(E) -> rusqlite::Error {
            move |e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            }
        }

        let chain = ChainId::from_str(&row.get::<_, String>(0)?)
            .map_err(|e| conversion(0)(std::io::Error::other(e.to_string())))?;
        let transaction_hash = row.get::<_, String>(1)?.parse::<B256>().map_err(conversion(1))?;
        let event_type = EventType::from_str(&row.get::<_, String>(3)?)
            .map_err(|e| conversion(3)(std::io::Error::other(e.to_string())))?;
        let block_hash = row
            .get::<_, Option<String>>(5)?
            .map(|h| h.parse::<B256>())
            .transpose()
            .map_err(conversion(5))?;
        let from_address = Address::from_str(&row.get::<_, String>(6)?).map_err(conversion(6))?;
        let to_address = Address::from_str(&row.get::<_, String>(7)?).map_err(conversion(7))?;
        let gas_price_wei = row
            .get::<_, Option<String>>(11)?
            .map(|p| p.parse::<u128>())
            .transpose()
            .map_err(conversion(11))?;
        let timestamp = parse_timestamp(&row.get::<_, String>(12)?)
            .map_err(|e| conversion(12)(std::io::Error::other(e.to_string())))?;

        Ok(ChainEvent {
            chain,
            event_type,
            transaction_hash,
            log_index: row.get(2)?,
            block_number: row.get(4)?,
            block_hash,
            from_address,
            to_address,
            amount: row.get(8)?,
            deposit_id: row.get(9)?,
            gas_used: row.get(10)?,
            gas_price_wei,
            timestamp,
        })
    }
}

#[derive(Debug)]
pub struct ChainStats {
    pub chain: String,
    pub total: usize,
    pub earliest_block: Option<u64>,
    pub latest_block: Option<u64>,
    pub deposits: usize,
    pub withdrawals: usize,
    pub transfers: usize,
}

#[derive(Debug)]
pub struct TransactionStats {
    pub chains: Vec<ChainStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Database;
    use crate::test_utils::{l1_deposit_event, l2_credit_event};

    #[test]
    fn test_upsert_is_keyed_by_hash_and_log_index() {
        let db = Database::new(":memory:").unwrap();
        let repo = TransactionRepository::new(&db.conn);

        let mut event = l1_deposit_event(7, 100, 0x07);
        repo.upsert(&event).unwrap();
        event.gas_used = Some(30_000);
        repo.upsert(&event).unwrap();
        repo.upsert(&l2_credit_event(7, 40, 0x17)).unwrap();

        let l1 = repo
            .query_transactions(Some(ChainId::L1), None, None, 10, 0)
            .unwrap();
        assert_eq!(l1.len(), 1);
        assert_eq!(l1[0].gas_used, Some(30_000));
        assert_eq!(l1[0], event);

        let by_deposit = repo.query_transactions(None, Some(7), None, 10, 0).unwrap();
        assert_eq!(by_deposit.len(), 2);
    }

    #[test]
    fn test_statistics_group_by_chain() {
        let db = Database::new(":memory:").unwrap();
        let repo = TransactionRepository::new(&db.conn);
        repo.upsert(&l1_deposit_event(1, 100, 0x01)).unwrap();
        repo.upsert(&l1_deposit_event(2, 150, 0x02)).unwrap();
        repo.upsert(&l2_credit_event(1, 20, 0x11)).unwrap();

        let stats = repo.get_statistics().unwrap();
        assert_eq!(stats.chains.len(), 2);
        assert_eq!(stats.chains[0].chain, "L1");
        assert_eq!(stats.chains[0].total, 2);
        assert_eq!(stats.chains[0].earliest_block, Some(100));
        assert_eq!(stats.chains[0].latest_block, Some(150));
        assert_eq!(stats.chains[1].deposits, 1);
    }
}
