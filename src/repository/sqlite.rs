use anyhow::Result;
use std::sync::Mutex;

use super::{
    AnalyticsRepository, AnalyticsStatus, ChainEvent, ChainId, CursorRepository, Database,
    GasAnalyticsRecord, OperationRepository, PendingOperation, Repository, TransactionRepository,
};

/// [`Repository`] over a single SQLite connection shared by every task.
pub struct SqliteRepository {
    db: Mutex<Database>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(database_url: &str) -> Result<Self> {
        Ok(Self::new(Database::new(database_url)?))
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        f(&db.conn)
    }
}

impl Repository for SqliteRepository {
    fn save_transaction(&self, event: &ChainEvent) -> Result<()> {
        self.with_conn(|conn| TransactionRepository::new(conn).upsert(event))
    }

    fn find_by_deposit_id(&self, deposit_id: u64) -> Result<Option<PendingOperation>> {
        self.with_conn(|conn| OperationRepository::new(conn).find_by_deposit_id(deposit_id))
    }

    fn save_operation(&self, operation: &PendingOperation) -> Result<()> {
        self.with_conn(|conn| OperationRepository::new(conn).upsert(operation))
    }

    fn unresolved_operations(&self) -> Result<Vec<PendingOperation>> {
        self.with_conn(|conn| OperationRepository::new(conn).list_unresolved())
    }

    fn deposits_since(&self, chain: ChainId, from_block: u64) -> Result<Vec<u64>> {
        self.with_conn(|conn| TransactionRepository::new(conn).deposit_ids_since(chain, from_block))
    }

    fn save_analytics(&self, record: &GasAnalyticsRecord) -> Result<bool> {
        self.with_conn(|conn| AnalyticsRepository::new(conn).upsert(record))
    }

    fn flag_analytics(
        &self,
        pair_key: &str,
        status: AnalyticsStatus,
        note: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| AnalyticsRepository::new(conn).flag(pair_key, status, note))
    }

    fn load_cursor(&self, chain: ChainId) -> Result<Option<u64>> {
        self.with_conn(|conn| CursorRepository::new(conn).get_last_processed_block(chain))
    }

    fn save_cursor(&self, chain: ChainId, block_number: u64) -> Result<()> {
        self.with_conn(|conn| {
            CursorRepository::new(conn).update_last_processed_block(chain, block_number)
        })
    }
}
