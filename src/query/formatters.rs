use crate::repository::{
    ChainEvent, CursorView, GasAnalyticsRecord, PendingOperation, SavingsSummary, SavingsTotals,
    TransactionStats, format_timestamp,
};
use alloy_primitives::U256;
use alloy_primitives::utils::{format_ether, format_units};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::{Value, json};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn csv_string(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut wtr = Writer::from_writer(vec![]);
    let _ = wtr.write_record(header);
    for row in rows {
        let _ = wtr.write_record(&row);
    }
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "[]".to_string())
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map_or("N/A".to_string(), |v| v.to_string())
}

fn format_amount(amount: &str) -> String {
    U256::from_str(amount)
        .ok()
        .and_then(|v| format_units(v, 18u8).ok())
        .unwrap_or_else(|| amount.to_string())
}

fn format_savings(savings: Option<f64>) -> String {
    savings.map_or("N/A".to_string(), |s| format!("{s:.2}%"))
}

fn format_tx_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

fn leg_hash(leg: Option<&ChainEvent>) -> String {
    leg.map_or("-".to_string(), |e| format!("{:?}", e.transaction_hash))
}

pub fn format_operations(operations: &[PendingOperation], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if operations.is_empty() {
                return "No operations found.".to_string();
            }
            let mut table = new_table(vec![
                "Deposit", "State", "L1 Tx", "L2 Tx", "Updated", "Deadline", "Retractions",
            ]);
            for op in operations {
                table.add_row(vec![
                    Cell::new(op.deposit_id),
                    Cell::new(op.state),
                    Cell::new(format_tx_hash(&leg_hash(op.l1_event.as_deref()))),
                    Cell::new(format_tx_hash(&leg_hash(op.l2_event.as_deref()))),
                    Cell::new(format_timestamp(&op.last_updated_at)),
                    Cell::new(or_na(op.timeout_deadline.as_ref().map(format_timestamp))),
                    Cell::new(op.retraction_count),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => pretty(&Value::Array(
            operations.iter().map(operation_json).collect(),
        )),
        OutputFormat::Csv => csv_string(
            &[
                "deposit_id",
                "state",
                "l1_transaction_hash",
                "l2_transaction_hash",
                "created_at",
                "last_updated_at",
                "timeout_deadline",
                "retraction_count",
            ],
            operations
                .iter()
                .map(|op| {
                    vec![
                        op.deposit_id.to_string(),
                        op.state.to_string(),
                        leg_hash(op.l1_event.as_deref()),
                        leg_hash(op.l2_event.as_deref()),
                        format_timestamp(&op.created_at),
                        format_timestamp(&op.last_updated_at),
                        op.timeout_deadline
                            .as_ref()
                            .map(format_timestamp)
                            .unwrap_or_default(),
                        op.retraction_count.to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

fn operation_json(op: &PendingOperation) -> Value {
    json!({
        "deposit_id": op.deposit_id,
        "state": op.state.as_str(),
        "l1_event": op.l1_event.as_deref().map(event_json),
        "l2_event": op.l2_event.as_deref().map(event_json),
        "created_at": format_timestamp(&op.created_at),
        "last_updated_at": format_timestamp(&op.last_updated_at),
        "timeout_deadline": op.timeout_deadline.as_ref().map(format_timestamp),
        "retraction_count": op.retraction_count,
    })
}

/// Detailed view of one operation: a metric table with both legs spelled out.
pub fn format_operation(op: &PendingOperation, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Field", "Value"]);
            let rows = [
                ("Deposit", op.deposit_id.to_string()),
                ("State", op.state.to_string()),
                ("L1 Tx", leg_hash(op.l1_event.as_deref())),
                (
                    "L1 Block",
                    or_na(op.l1_event.as_ref().map(|e| e.block_number)),
                ),
                ("L2 Tx", leg_hash(op.l2_event.as_deref())),
                (
                    "L2 Block",
                    or_na(op.l2_event.as_ref().map(|e| e.block_number)),
                ),
                (
                    "Amount",
                    or_na(
                        op.l1_event
                            .as_ref()
                            .or(op.l2_event.as_ref())
                            .map(|e| format_amount(&e.amount)),
                    ),
                ),
                ("Created", format_timestamp(&op.created_at)),
                ("Updated", format_timestamp(&op.last_updated_at)),
                (
                    "Deadline",
                    or_na(op.timeout_deadline.as_ref().map(format_timestamp)),
                ),
                ("Retractions", op.retraction_count.to_string()),
            ];
            for (field, value) in rows {
                table.add_row(vec![Cell::new(field), Cell::new(value)]);
            }
            table.to_string()
        }
        OutputFormat::Json => pretty(&operation_json(op)),
        OutputFormat::Csv => format_operations(std::slice::from_ref(op), format),
    }
}

fn event_json(event: &ChainEvent) -> Value {
    json!({
        "chain": event.chain.as_str(),
        "event_type": event.event_type.as_str(),
        "transaction_hash": format!("{:?}", event.transaction_hash),
        "log_index": event.log_index,
        "block_number": event.block_number,
        "from": format!("{:?}", event.from_address),
        "to": format!("{:?}", event.to_address),
        "amount": format_amount(&event.amount),
        "amount_wei": event.amount,
        "deposit_id": event.deposit_id,
        "gas_used": event.gas_used,
        "gas_price_wei": event.gas_price_wei.map(|p| p.to_string()),
        "timestamp": format_timestamp(&event.timestamp),
    })
}

pub fn format_transactions(events: &[ChainEvent], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if events.is_empty() {
                return "No transactions found.".to_string();
            }
            let mut table = new_table(vec![
                "Chain", "Block", "Type", "Deposit", "From", "To", "Amount", "Gas Used", "Tx Hash",
            ]);
            for event in events {
                table.add_row(vec![
                    Cell::new(event.chain),
                    Cell::new(event.block_number),
                    Cell::new(event.event_type.as_str()),
                    Cell::new(or_na(event.deposit_id)),
                    Cell::new(format!("{:#}", event.from_address)),
                    Cell::new(format!("{:#}", event.to_address)),
                    Cell::new(format_amount(&event.amount)),
                    Cell::new(or_na(event.gas_used)),
                    Cell::new(format_tx_hash(&format!("{:?}", event.transaction_hash))),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => pretty(&Value::Array(events.iter().map(event_json).collect())),
        OutputFormat::Csv => csv_string(
            &[
                "chain",
                "block_number",
                "event_type",
                "deposit_id",
                "from",
                "to",
                "amount_wei",
                "gas_used",
                "gas_price_wei",
                "transaction_hash",
                "log_index",
            ],
            events
                .iter()
                .map(|e| {
                    vec![
                        e.chain.to_string(),
                        e.block_number.to_string(),
                        e.event_type.as_str().to_string(),
                        e.deposit_id.map(|d| d.to_string()).unwrap_or_default(),
                        format!("{:?}", e.from_address),
                        format!("{:?}", e.to_address),
                        e.amount.clone(),
                        e.gas_used.map(|g| g.to_string()).unwrap_or_default(),
                        e.gas_price_wei.map(|p| p.to_string()).unwrap_or_default(),
                        format!("{:?}", e.transaction_hash),
                        e.log_index.to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

pub fn format_analytics(records: &[GasAnalyticsRecord], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if records.is_empty() {
                return "No analytics records found.".to_string();
            }
            let mut table = new_table(vec![
                "Deposit",
                "Operation",
                "L1 Cost (ETH)",
                "L2 Cost (ETH)",
                "Savings",
                "Status",
                "Timestamp",
            ]);
            for record in records {
                table.add_row(vec![
                    Cell::new(or_na(record.deposit_id)),
                    Cell::new(&record.operation_type),
                    Cell::new(or_na(record.l1_gas_cost_eth.as_deref())),
                    Cell::new(or_na(record.l2_gas_cost_eth.as_deref())),
                    Cell::new(format_savings(record.savings_percentage)),
                    Cell::new(record.status.as_str()),
                    Cell::new(format_timestamp(&record.timestamp)),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => pretty(&Value::Array(
            records
                .iter()
                .map(|r| {
                    json!({
                        "pair_key": r.pair_key,
                        "deposit_id": r.deposit_id,
                        "operation_type": r.operation_type,
                        "l1_gas_cost_wei": r.l1_gas_cost_wei.map(|v| v.to_string()),
                        "l2_gas_cost_wei": r.l2_gas_cost_wei.map(|v| v.to_string()),
                        "l1_gas_cost_eth": r.l1_gas_cost_eth,
                        "l2_gas_cost_eth": r.l2_gas_cost_eth,
                        "savings_percentage": r.savings_percentage,
                        "status": r.status.as_str(),
                        "note": r.note,
                        "timestamp": format_timestamp(&r.timestamp),
                    })
                })
                .collect(),
        )),
        OutputFormat::Csv => csv_string(
            &[
                "pair_key",
                "deposit_id",
                "operation_type",
                "l1_gas_cost_wei",
                "l2_gas_cost_wei",
                "savings_percentage",
                "status",
                "note",
                "timestamp",
            ],
            records
                .iter()
                .map(|r| {
                    vec![
                        r.pair_key.clone(),
                        r.deposit_id.map(|d| d.to_string()).unwrap_or_default(),
                        r.operation_type.clone(),
                        r.l1_gas_cost_wei.map(|v| v.to_string()).unwrap_or_default(),
                        r.l2_gas_cost_wei.map(|v| v.to_string()).unwrap_or_default(),
                        r.savings_percentage.map(|s| s.to_string()).unwrap_or_default(),
                        r.status.as_str().to_string(),
                        r.note.clone().unwrap_or_default(),
                        format_timestamp(&r.timestamp),
                    ]
                })
                .collect(),
        ),
    }
}

fn totals_json(totals: &SavingsTotals) -> Value {
    json!({
        "records": totals.records,
        "average_savings_percentage": totals.average_savings_percentage,
        "total_l1_cost_wei": totals.total_l1_cost_wei.to_string(),
        "total_l2_cost_wei": totals.total_l2_cost_wei.to_string(),
        "total_saved_wei": totals.total_saved_wei.to_string(),
        "total_saved_eth": format_ether(totals.total_saved_wei),
    })
}

pub fn format_summary(summary: &SavingsSummary, format: &OutputFormat) -> String {
    let rows: Vec<(&str, &SavingsTotals)> = std::iter::once(("ALL", &summary.total))
        .chain(
            summary
                .by_operation_type
                .iter()
                .map(|(op, totals)| (op.as_str(), totals)),
        )
        .collect();

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec![
                "Operation",
                "Records",
                "Avg Savings",
                "L1 Cost (ETH)",
                "L2 Cost (ETH)",
                "Saved (ETH)",
            ]);
            for (op, totals) in rows {
                table.add_row(vec![
                    Cell::new(op),
                    Cell::new(totals.records),
                    Cell::new(format_savings(totals.average_savings_percentage)),
                    Cell::new(format_ether(totals.total_l1_cost_wei)),
                    Cell::new(format_ether(totals.total_l2_cost_wei)),
                    Cell::new(format_ether(totals.total_saved_wei)),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let by_type: serde_json::Map<String, Value> = summary
                .by_operation_type
                .iter()
                .map(|(op, totals)| (op.clone(), totals_json(totals)))
                .collect();
            pretty(&json!({
                "total": totals_json(&summary.total),
                "by_operation_type": by_type,
            }))
        }
        OutputFormat::Csv => csv_string(
            &[
                "operation_type",
                "records",
                "average_savings_percentage",
                "total_l1_cost_wei",
                "total_l2_cost_wei",
                "total_saved_wei",
            ],
            rows.into_iter()
                .map(|(op, t)| {
                    vec![
                        op.to_string(),
                        t.records.to_string(),
                        t.average_savings_percentage
                            .map(|s| s.to_string())
                            .unwrap_or_default(),
                        t.total_l1_cost_wei.to_string(),
                        t.total_l2_cost_wei.to_string(),
                        t.total_saved_wei.to_string(),
                    ]
                })
                .collect(),
        ),
    }
}

pub fn format_cursors(cursors: &[CursorView], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if cursors.is_empty() {
                return "No cursors persisted yet.".to_string();
            }
            let mut table = new_table(vec!["Chain", "Last Processed Block", "Updated"]);
            for cursor in cursors {
                table.add_row(vec![
                    Cell::new(&cursor.chain),
                    Cell::new(cursor.last_processed_block),
                    Cell::new(&cursor.updated_at),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => pretty(&Value::Array(
            cursors
                .iter()
                .map(|c| {
                    json!({
                        "chain": c.chain,
                        "last_processed_block": c.last_processed_block,
                        "updated_at": c.updated_at,
                    })
                })
                .collect(),
        )),
        OutputFormat::Csv => csv_string(
            &["chain", "last_processed_block", "updated_at"],
            cursors
                .iter()
                .map(|c| {
                    vec![
                        c.chain.clone(),
                        c.last_processed_block.to_string(),
                        c.updated_at.clone(),
                    ]
                })
                .collect(),
        ),
    }
}

pub fn format_stats(
    stats: &TransactionStats,
    operations: &[(String, usize)],
    format: &OutputFormat,
) -> String {
    let mut rows: Vec<(String, String)> = Vec::new();
    for chain in &stats.chains {
        rows.push((format!("{} Events", chain.chain), chain.total.to_string()));
        rows.push((format!("{} Deposits", chain.chain), chain.deposits.to_string()));
        rows.push((
            format!("{} Withdrawals", chain.chain),
            chain.withdrawals.to_string(),
        ));
        rows.push((format!("{} Transfers", chain.chain), chain.transfers.to_string()));
        rows.push((format!("{} Earliest Block", chain.chain), or_na(chain.earliest_block)));
        rows.push((format!("{} Latest Block", chain.chain), or_na(chain.latest_block)));
    }
    for (state, count) in operations {
        rows.push((format!("Operations {state}"), count.to_string()));
    }

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value"]);
            for (metric, value) in rows {
                table.add_row(vec![Cell::new(metric), Cell::new(value)]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let chains: Vec<Value> = stats
                .chains
                .iter()
                .map(|c| {
                    json!({
                        "chain": c.chain,
                        "total": c.total,
                        "deposits": c.deposits,
                        "withdrawals": c.withdrawals,
                        "transfers": c.transfers,
                        "earliest_block": c.earliest_block,
                        "latest_block": c.latest_block,
                    })
                })
                .collect();
            let operations: serde_json::Map<String, Value> = operations
                .iter()
                .map(|(state, count)| (state.clone(), json!(count)))
                .collect();
            pretty(&json!({ "chains": chains, "operations": operations }))
        }
        OutputFormat::Csv => csv_string(
            &["metric", "value"],
            rows.into_iter().map(|(m, v)| vec![m, v]).collect(),
        ),
    }
}
