use super::models::ChainId;
use super::format_timestamp;
use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

pub struct CursorRepository<'a> {
    conn: &'a rusqlite::Connection,
}

#[derive(Debug)]
pub struct CursorView {
    pub chain: String,
    pub last_processed_block: u64,
    pub updated_at: String,
}

impl<'a> CursorRepository<'a> {
    const UPSERT_CURSOR: &'static str =
        "INSERT INTO chain_cursors (chain, last_processed_block, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(chain) DO UPDATE SET
            last_processed_block = excluded.last_processed_block,
            updated_at = excluded.updated_at";

    const GET_LAST_PROCESSED_BLOCK: &'static str =
        "SELECT last_processed_block FROM chain_cursors WHERE chain = ?1";

    const LIST_CURSORS: &'static str =
        "SELECT chain, last_processed_block, updated_at FROM chain_cursors ORDER BY chain";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn get_last_processed_block(&self, chain: ChainId) -> Result<Option<u64>> {
        let block: Option<u64> = self
            .conn
            .query_row(
                Self::GET_LAST_PROCESSED_BLOCK,
                params![chain.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block)
    }

    pub fn update_last_processed_block(&self, chain: ChainId, block_number: u64) -> Result<()> {
        self.conn.execute(
            Self::UPSERT_CURSOR,
            params![chain.as_str(), block_number, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<CursorView>> {
        let mut stmt = self.conn.prepare(Self::LIST_CURSORS)?;
        let cursors = stmt
            .query_map([], |row| {
                Ok(CursorView {
                    chain: row.get(0)?,
                    last_processed_block: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cursors)
    }
}
