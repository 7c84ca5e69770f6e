use alloy_primitives::U256;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::models::{AnalyticsStatus, GasAnalyticsRecord};
use super::{format_timestamp, parse_timestamp};

pub struct AnalyticsRepository<'a> {
    conn: &'a Connection,
}

struct AnalyticsRow {
    pair_key: String,
    deposit_id: Option<u64>,
    operation_type: String,
    l1_gas_cost_wei: Option<String>,
    l2_gas_cost_wei: Option<String>,
    l1_gas_cost_eth: Option<String>,
    l2_gas_cost_eth: Option<String>,
    savings_percentage: Option<f64>,
    status: String,
    note: Option<String>,
    timestamp: String,
}

impl<'a> AnalyticsRepository<'a> {
    const UPSERT_RECORD: &'static str = "INSERT INTO gas_analytics (
            pair_key, deposit_id, operation_type, l1_gas_cost_wei, l2_gas_cost_wei,
            l1_gas_cost_eth, l2_gas_cost_eth, savings_percentage, status, note, timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(pair_key) DO UPDATE SET
            l1_gas_cost_wei = excluded.l1_gas_cost_wei,
            l2_gas_cost_wei = excluded.l2_gas_cost_wei,
            l1_gas_cost_eth = excluded.l1_gas_cost_eth,
            l2_gas_cost_eth = excluded.l2_gas_cost_eth,
            savings_percentage = excluded.savings_percentage,
            status = excluded.status,
            note = excluded.note";

    const EXISTS: &'static str = "SELECT 1 FROM gas_analytics WHERE pair_key = ?1";

    const FLAG_RECORD: &'static str =
        "UPDATE gas_analytics SET status = ?1, note = ?2 WHERE pair_key = ?3";

    const SELECT_RECORD: &'static str = "SELECT pair_key, deposit_id, operation_type, l1_gas_cost_wei, l2_gas_cost_wei, l1_gas_cost_eth, l2_gas_cost_eth, savings_percentage, status, note, timestamp FROM gas_analytics";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts or refreshes the record for its pair. Returns `true` when the pair was new.
    pub fn upsert(&self, record: &GasAnalyticsRecord) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;

        let existed = tx
            .query_row(Self::EXISTS, params![record.pair_key], |_| Ok(()))
            .optional()?
            .is_some();

        tx.execute(
            Self::UPSERT_RECORD,
            params![
                record.pair_key,
                record.deposit_id,
                record.operation_type,
                record.l1_gas_cost_wei.map(|v| v.to_string()),
                record.l2_gas_cost_wei.map(|v| v.to_string()),
                record.l1_gas_cost_eth,
                record.l2_gas_cost_eth,
                record.savings_percentage,
                record.status.as_str(),
                record.note,
                format_timestamp(&record.timestamp),
            ],
        )?;

        tx.commit()?;
        Ok(!existed)
    }

    pub fn flag(&self, pair_key: &str, status: AnalyticsStatus, note: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(Self::FLAG_RECORD, params![status.as_str(), note, pair_key])?;
        Ok(updated > 0)
    }

    pub fn find(&self, pair_key: &str) -> Result<Option<GasAnalyticsRecord>> {
        let query = format!("{} WHERE pair_key = ?1", Self::SELECT_RECORD);
        let row = self
            .conn
            .query_row(&query, params![pair_key], Self::read_row)
            .optional()?;
        row.map(Self::decode).transpose()
    }

    pub fn count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM gas_analytics", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn recent(
        &self,
        operation_type: Option<&str>,
        status: Option<AnalyticsStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GasAnalyticsRecord>> {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(op) = operation_type {
            conditions.push("operation_type = ?");
            params.push(Box::new(op.to_string()));
        }

        if let Some(status) = status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        let mut query = Self::SELECT_RECORD.to_string();
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(&format!(
            " ORDER BY timestamp DESC LIMIT {limit} OFFSET {offset}"
        ));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    /// Aggregates complete records since `since` (all time when `None`).
    pub fn summary(&self, since: Option<DateTime<Utc>>) -> Result<SavingsSummary> {
        let mut query = format!(
            "{} WHERE status = '{}'",
            Self::SELECT_RECORD,
            AnalyticsStatus::Complete.as_str()
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(since) = since {
            query.push_str(" AND timestamp >= ?");
            params.push(Box::new(format_timestamp(&since)));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let records = rows
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>>>()?;

        let mut by_type: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut overall = Accumulator::default();
        for record in &records {
            overall.add(record)?;
            by_type
                .entry(record.operation_type.clone())
                .or_default()
                .add(record)?;
        }

        Ok(SavingsSummary {
            total: overall.finish(),
            by_operation_type: by_type
                .into_iter()
                .map(|(operation_type, acc)| (operation_type, acc.finish()))
                .collect(),
        })
    }

    fn read_row(row: &Row) -> rusqlite::Result<AnalyticsRow> {
        Ok(AnalyticsRow {
            pair_key: row.get(0)?,
            deposit_id: row.get(1)?,
            operation_type: row.get(2)?,
            l1_gas_cost_wei: row.get(3)?,
            l2_gas_cost_wei: row.get(4)?,
            l1_gas_cost_eth: row.get(5)?,
            l2_gas_cost_eth: row.get(6)?,
            savings_percentage: row.get(7)?,
            status: row.get(8)?,
            note: row.get(9)?,
            timestamp: row.get(10)?,
        })
    }

    fn decode(row: AnalyticsRow) -> Result<GasAnalyticsRecord> {
        let parse_wei = |raw: Option<String>| -> Result<Option<U256>> {
            raw.map(|v| {
                U256::from_str(&v)
                    .map_err(|_| anyhow::anyhow!("Invalid wei value in database: {}", v))
            })
            .transpose()
        };

        Ok(GasAnalyticsRecord {
            pair_key: row.pair_key,
            deposit_id: row.deposit_id,
            operation_type: row.operation_type,
            l1_gas_cost_wei: parse_wei(row.l1_gas_cost_wei)?,
            l2_gas_cost_wei: parse_wei(row.l2_gas_cost_wei)?,
            l1_gas_cost_eth: row.l1_gas_cost_eth,
            l2_gas_cost_eth: row.l2_gas_cost_eth,
            savings_percentage: row.savings_percentage,
            status: AnalyticsStatus::from_str(&row.status)?,
            note: row.note,
            timestamp: parse_timestamp(&row.timestamp)?,
        })
    }
}

#[derive(Default)]
struct Accumulator {
    records: usize,
    savings_sum: f64,
    savings_count: usize,
    l1_total: U256,
    l2_total: U256,
}

impl Accumulator {
    fn add(&mut self, record: &GasAnalyticsRecord) -> Result<()> {
        self.records += 1;
        if let Some(savings) = record.savings_percentage {
            self.savings_sum += savings;
            self.savings_count += 1;
        }
        self.l1_total = self
            .l1_total
            .checked_add(record.l1_gas_cost_wei.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("Overflow in L1 cost sum"))?;
        self.l2_total = self
            .l2_total
            .checked_add(record.l2_gas_cost_wei.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("Overflow in L2 cost sum"))?;
        Ok(())
    }

    fn finish(self) -> SavingsTotals {
        SavingsTotals {
            records: self.records,
            average_savings_percentage: (self.savings_count > 0)
                .then(|| self.savings_sum / self.savings_count as f64),
            total_l1_cost_wei: self.l1_total,
            total_l2_cost_wei: self.l2_total,
            total_saved_wei: self.l1_total.saturating_sub(self.l2_total),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavingsTotals {
    pub records: usize,
    pub average_savings_percentage: Option<f64>,
    pub total_l1_cost_wei: U256,
    pub total_l2_cost_wei: U256,
    pub total_saved_wei: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavingsSummary {
    pub total: SavingsTotals,
    pub by_operation_type: Vec<(String, SavingsTotals)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Database;

    fn record(pair_key: &str, l1: u64, l2: u64, savings: Option<f64>) -> GasAnalyticsRecord {
        GasAnalyticsRecord {
            pair_key: pair_key.to_string(),
            deposit_id: Some(1),
            operation_type: "BRIDGE_DEPOSIT".to_string(),
            l1_gas_cost_wei: Some(U256::from(l1)),
            l2_gas_cost_wei: Some(U256::from(l2)),
            l1_gas_cost_eth: None,
            l2_gas_cost_eth: None,
            savings_percentage: savings,
            status: AnalyticsStatus::Complete,
            note: None,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_upsert_reports_new_pairs_once() {
        let db = Database::new(":memory:").unwrap();
        let repo = AnalyticsRepository::new(&db.conn);

        assert!(repo.upsert(&record("a:b", 100, 10, Some(90.0))).unwrap());
        assert!(!repo.upsert(&record("a:b", 100, 10, Some(90.0))).unwrap());
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn test_flag_marks_record() {
        let db = Database::new(":memory:").unwrap();
        let repo = AnalyticsRepository::new(&db.conn);
        repo.upsert(&record("a:b", 100, 10, Some(90.0))).unwrap();

        assert!(repo.flag("a:b", AnalyticsStatus::Retracted, "reorg").unwrap());
        assert!(!repo.flag("missing", AnalyticsStatus::Retracted, "reorg").unwrap());

        let stored = repo.find("a:b").unwrap().unwrap();
        assert_eq!(stored.status, AnalyticsStatus::Retracted);
        assert_eq!(stored.note.as_deref(), Some("reorg"));
        assert_eq!(
            repo.recent(None, Some(AnalyticsStatus::Retracted), 10, 0)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_summary_ignores_flagged_records() {
        let db = Database::new(":memory:").unwrap();
        let repo = AnalyticsRepository::new(&db.conn);
        repo.upsert(&record("a:b", 100, 10, Some(90.0))).unwrap();
        repo.upsert(&record("c:d", 200, 100, Some(50.0))).unwrap();
        repo.upsert(&record("e:f", 0, 10, None)).unwrap();
        repo.upsert(&record("g:h", 1000, 1, Some(99.9))).unwrap();
        repo.flag("g:h", AnalyticsStatus::Retracted, "reorg").unwrap();

        let summary = repo.summary(None).unwrap();
        assert_eq!(summary.total.records, 3);
        assert_eq!(summary.total.average_savings_percentage, Some(70.0));
        assert_eq!(summary.total.total_l1_cost_wei, U256::from(300));
        assert_eq!(summary.total.total_saved_wei, U256::from(180));
        assert_eq!(summary.by_operation_type.len(), 1);

        let later = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert_eq!(repo.summary(Some(later)).unwrap().total.records, 0);
    }
}
