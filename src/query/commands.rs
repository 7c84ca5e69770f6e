use crate::query::formatters::{
    OutputFormat, format_analytics, format_cursors, format_operation, format_operations,
    format_stats, format_summary, format_transactions,
};
use crate::repository::{
    AnalyticsRepository, AnalyticsStatus, ChainId, CursorRepository, OperationRepository,
    OperationState, TransactionRepository,
};
use anyhow::Result;
use chrono::{Duration, Utc};
use std::str::FromStr;

pub fn cmd_pending(
    repo: &OperationRepository,
    states: &[String],
    limit: usize,
    offset: usize,
    format: &OutputFormat,
) -> Result<()> {
    // Without an explicit filter, show everything still waiting on a leg
    let states = if states.is_empty() {
        vec![OperationState::AwaitingL1, OperationState::AwaitingL2]
    } else {
        states
            .iter()
            .map(|s| OperationState::from_str(s))
            .collect::<Result<Vec<_>>>()?
    };

    let operations = repo.list_by_state(&states, limit, offset)?;
    let output = format_operations(&operations, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_operation(repo: &OperationRepository, deposit_id: u64, format: &OutputFormat) -> Result<()> {
    let operation = repo
        .find_by_deposit_id(deposit_id)?
        .ok_or_else(|| anyhow::anyhow!("No operation found for deposit {}", deposit_id))?;

    let output = format_operation(&operation, format);
    println!("{output}");

    Ok(())
}

#[derive(Default)]
pub struct TransactionQuery {
    pub chain: Option<String>,
    pub deposit_id: Option<u64>,
    pub block: Option<u64>,
    pub block_range: Option<(u64, u64)>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_transactions(
    repo: &TransactionRepository,
    query: TransactionQuery,
    format: &OutputFormat,
) -> Result<()> {
    let chain = query.chain.as_deref().map(ChainId::from_str).transpose()?;

    let block_range = if let Some(block_num) = query.block {
        Some((block_num, block_num))
    } else {
        query.block_range
    };

    if block_range.is_some() && chain.is_none() {
        return Err(anyhow::anyhow!(
            "Block filters need --chain, block numbers differ between L1 and L2"
        ));
    }

    let events = repo.query_transactions(
        chain,
        query.deposit_id,
        block_range,
        query.limit,
        query.offset,
    )?;
    let output = format_transactions(&events, format);
    println!("{output}");

    Ok(())
}

pub struct AnalyticsQuery {
    pub operation_type: Option<String>,
    pub status: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_analytics(
    repo: &AnalyticsRepository,
    query: AnalyticsQuery,
    format: &OutputFormat,
) -> Result<()> {
    let status = query
        .status
        .as_deref()
        .map(AnalyticsStatus::from_str)
        .transpose()?;
    let operation_type = query.operation_type.map(|op| op.to_uppercase());

    let records = repo.recent(operation_type.as_deref(), status, query.limit, query.offset)?;
    let output = format_analytics(&records, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_summary(repo: &AnalyticsRepository, hours: Option<i64>, format: &OutputFormat) -> Result<()> {
    let since = hours.map(|h| Utc::now() - Duration::hours(h));
    let summary = repo.summary(since)?;
    let output = format_summary(&summary, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_cursors(repo: &CursorRepository, format: &OutputFormat) -> Result<()> {
    let cursors = repo.list()?;
    let output = format_cursors(&cursors, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_stats(
    transaction_repo: &TransactionRepository,
    operation_repo: &OperationRepository,
    format: &OutputFormat,
) -> Result<()> {
    let stats = transaction_repo.get_statistics()?;
    let operations = operation_repo.count_by_state()?;
    let output = format_stats(&stats, &operations, format);
    println!("{output}");

    Ok(())
}
