use anyhow::{Context, Result};
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;

        let db = Database { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        // Per-chain resume point
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_cursors (
                chain TEXT PRIMARY KEY,
                last_processed_block INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Every normalized event seen on either chain
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_transactions (
                chain TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash TEXT,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                deposit_id INTEGER,
                gas_used INTEGER,
                gas_price_wei TEXT,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (chain, transaction_hash, log_index)
            )",
            [],
        )?;

        // Snapshot of each cross-chain deposit
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_operations (
                deposit_id INTEGER PRIMARY KEY,
                state TEXT NOT NULL,
                l1_event TEXT,
                l2_event TEXT,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                timeout_deadline TEXT,
                retraction_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS gas_analytics (
                pair_key TEXT PRIMARY KEY,
                deposit_id INTEGER,
                operation_type TEXT NOT NULL,
                l1_gas_cost_wei TEXT,
                l2_gas_cost_wei TEXT,
                l1_gas_cost_eth TEXT,
                l2_gas_cost_eth TEXT,
                savings_percentage REAL,
                status TEXT NOT NULL,
                note TEXT,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        // Indexes for the query CLI
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_block_number
             ON chain_transactions(chain, block_number)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_deposit_id
             ON chain_transactions(deposit_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_state
             ON pending_operations(state)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_gas_operation_type
             ON gas_analytics(operation_type)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_gas_timestamp
             ON gas_analytics(timestamp)",
            [],
        )?;

        Ok(())
    }
}
