use anyhow::Result;
use clap::{Parser, Subcommand};
use bridge_monitor::query::commands::{
    AnalyticsQuery, TransactionQuery, cmd_analytics, cmd_cursors, cmd_operation, cmd_pending,
    cmd_stats, cmd_summary, cmd_transactions,
};
use bridge_monitor::query::formatters::OutputFormat;
use bridge_monitor::repository::{
    AnalyticsRepository, CursorRepository, Database, OperationRepository, TransactionRepository,
};

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query bridge monitor state", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./bridge-monitor.db")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operations by state (defaults to those still awaiting a leg)
    Pending {
        #[arg(long = "state")]
        states: Vec<String>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Operation {
        deposit_id: u64,
    },
    Transactions {
        #[arg(long)]
        chain: Option<String>,

        #[arg(long)]
        deposit_id: Option<u64>,

        #[arg(long)]
        block: Option<u64>,

        #[arg(long, num_args = 2, value_names = ["START", "END"])]
        block_range: Option<Vec<u64>>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Analytics {
        #[arg(long)]
        operation_type: Option<String>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Savings summary, optionally over the last N hours
    Summary {
        #[arg(long)]
        hours: Option<i64>,
    },
    Cursors,
    Stats,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let db = Database::new(&cli.database_url)?;
    let transaction_repo = TransactionRepository::new(&db.conn);
    let operation_repo = OperationRepository::new(&db.conn);
    let analytics_repo = AnalyticsRepository::new(&db.conn);
    let cursor_repo = CursorRepository::new(&db.conn);

    match cli.command {
        Commands::Pending {
            states,
            limit,
            offset,
        } => {
            cmd_pending(&operation_repo, &states, limit, offset, &format)?;
        }
        Commands::Operation { deposit_id } => {
            cmd_operation(&operation_repo, deposit_id, &format)?;
        }
        Commands::Transactions {
            chain,
            deposit_id,
            block,
            block_range,
            limit,
            offset,
        } => {
            let range = block_range.map(|v| if v.len() >= 2 { (v[0], v[1]) } else { (0, 0) });
            let query = TransactionQuery {
                chain,
                deposit_id,
                block,
                block_range: range,
                limit,
                offset,
            };
            cmd_transactions(&transaction_repo, query, &format)?;
        }
        Commands::Analytics {
            operation_type,
            status,
            limit,
            offset,
        } => {
            let query = AnalyticsQuery {
                operation_type,
                status,
                limit,
                offset,
            };
            cmd_analytics(&analytics_repo, query, &format)?;
        }
        Commands::Summary { hours } => {
            cmd_summary(&analytics_repo, hours, &format)?;
        }
        Commands::Cursors => {
            cmd_cursors(&cursor_repo, &format)?;
        }
        Commands::Stats => {
            cmd_stats(&transaction_repo, &operation_repo, &format)?;
        }
    }

    Ok(())
}
