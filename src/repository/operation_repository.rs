use super::models::{ChainEvent, OperationState, PendingOperation};
use super::{format_timestamp, parse_timestamp};
use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use std::str::FromStr;
use std::sync::Arc;

pub struct OperationRepository<'a> {
    conn: &'a rusqlite::Connection,
}

/// Raw row, decoded outside the rusqlite closure so JSON errors surface through anyhow.
struct OperationRow {
    deposit_id: u64,
    state: String,
    l1_event: Option<String>,
    l2_event: Option<String>,
    created_at: String,
    last_updated_at: String,
    timeout_deadline: Option<String>,
    retraction_count: u32,
}

impl<'a> OperationRepository<'a> {
    const UPSERT_OPERATION: &'static str = "INSERT INTO pending_operations (
            deposit_id, state, l1_event, l2_event, created_at, last_updated_at,
            timeout_deadline, retraction_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(deposit_id) DO UPDATE SET
            state = excluded.state,
            l1_event = excluded.l1_event,
            l2_event = excluded.l2_event,
            last_updated_at = excluded.last_updated_at,
            timeout_deadline = excluded.timeout_deadline,
            retraction_count = excluded.retraction_count";

    const SELECT_OPERATION: &'static str = "SELECT deposit_id, state, l1_event, l2_event, created_at, last_updated_at, timeout_deadline, retraction_count FROM pending_operations";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, operation: &PendingOperation) -> Result<()> {
        let l1_event = operation
            .l1_event
            .as_deref()
            .map(serde_json::to_string)
            .transpose()?;
        let l2_event = operation
            .l2_event
            .as_deref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            Self::UPSERT_OPERATION,
            params![
                operation.deposit_id,
                operation.state.as_str(),
                l1_event,
                l2_event,
                format_timestamp(&operation.created_at),
                format_timestamp(&operation.last_updated_at),
                operation.timeout_deadline.as_ref().map(format_timestamp),
                operation.retraction_count,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_deposit_id(&self, deposit_id: u64) -> Result<Option<PendingOperation>> {
        let query = format!("{} WHERE deposit_id = ?1", Self::SELECT_OPERATION);
        let row = self
            .conn
            .query_row(&query, params![deposit_id], Self::read_row)
            .optional()?;
        row.map(Self::decode).transpose()
    }

    pub fn list_by_state(
        &self,
        states: &[OperationState],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PendingOperation>> {
        let mut query = Self::SELECT_OPERATION.to_string();
        if !states.is_empty() {
            let placeholders = vec!["?"; states.len()].join(", ");
            query.push_str(&format!(" WHERE state IN ({placeholders})"));
        }
        query.push_str(&format!(
            " ORDER BY last_updated_at DESC LIMIT {limit} OFFSET {offset}"
        ));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(states.iter().map(|s| s.as_str())),
                Self::read_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    /// Every operation still waiting for a leg, oldest deposit first.
    pub fn list_unresolved(&self) -> Result<Vec<PendingOperation>> {
        let query = format!(
            "{} WHERE state IN ('AWAITING_L1', 'AWAITING_L2') ORDER BY deposit_id",
            Self::SELECT_OPERATION
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map([], Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    pub fn count_by_state(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT state, COUNT(*) FROM pending_operations GROUP BY state ORDER BY state",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn read_row(row: &Row) -> rusqlite::Result<OperationRow> {
        Ok(OperationRow {
            deposit_id: row.get(0)?,
            state: row.get(1)?,
            l1_event: row.get(2)?,
            l2_event: row.get(3)?,
            created_at: row.get(4)?,
            last_updated_at: row.get(5)?,
            timeout_deadline: row.get(6)?,
            retraction_count: row.get(7)?,
        })
    }

    fn decode(row: OperationRow) -> Result<PendingOperation> {
        let decode_event = |raw: Option<String>| -> Result<Option<Arc<ChainEvent>>> {
            raw.map(|json| {
                serde_json::from_str::<ChainEvent>(&json)
                    .map(Arc::new)
                    .with_context(|| format!("Corrupt event snapshot for deposit {}", row.deposit_id))
            })
            .transpose()
        };

        Ok(PendingOperation {
            deposit_id: row.deposit_id,
            l1_event: decode_event(row.l1_event)?,
            l2_event: decode_event(row.l2_event)?,
            state: OperationState::from_str(&row.state)?,
            created_at: parse_timestamp(&row.created_at)?,
            last_updated_at: parse_timestamp(&row.last_updated_at)?,
            timeout_deadline: row
                .timeout_deadline
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            retraction_count: row.retraction_count,
        })
    }
}
