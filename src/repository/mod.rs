pub mod analytics_repository;
pub mod cursor_repository;
pub mod database;
pub mod models;
pub mod operation_repository;
pub mod sqlite;
pub mod transaction_repository;

pub use analytics_repository::{AnalyticsRepository, SavingsSummary, SavingsTotals};
pub use cursor_repository::{CursorRepository, CursorView};
pub use database::Database;
pub use models::{
    AnalyticsStatus, ChainEvent, ChainId, EventKey, EventType, GasAnalyticsRecord,
    OperationState, PendingOperation, pair_key,
};
pub use operation_repository::OperationRepository;
pub use sqlite::SqliteRepository;
pub use transaction_repository::{ChainStats, TransactionRepository, TransactionStats};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Persistence seam used by the watchers and the reconciliation engine.
///
/// Every write is an upsert keyed by the record's natural identity, so replays
/// after a crash or a reorg never produce duplicates.
pub trait Repository: Send + Sync {
    fn save_transaction(&self, event: &ChainEvent) -> Result<()>;

    fn find_by_deposit_id(&self, deposit_id: u64) -> Result<Option<PendingOperation>>;

    fn save_operation(&self, operation: &PendingOperation) -> Result<()>;

    /// Operations in `AWAITING_L1` or `AWAITING_L2`.
    fn unresolved_operations(&self) -> Result<Vec<PendingOperation>>;

    /// Deposits with a leg stored on `chain` at or above `from_block`.
    fn deposits_since(&self, chain: ChainId, from_block: u64) -> Result<Vec<u64>>;

    /// Returns `true` when no record existed for the pair yet.
    fn save_analytics(&self, record: &GasAnalyticsRecord) -> Result<bool>;

    /// Returns `false` when there is no record for `pair_key`.
    fn flag_analytics(&self, pair_key: &str, status: AnalyticsStatus, note: &str)
    -> Result<bool>;

    fn load_cursor(&self, chain: ChainId) -> Result<Option<u64>>;

    fn save_cursor(&self, chain: ChainId, block_number: u64) -> Result<()>;
}

pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in database: {}", raw))?;
    Ok(parsed.with_timezone(&Utc))
}
