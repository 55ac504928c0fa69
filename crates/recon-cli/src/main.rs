use anyhow::Result;
use clap::{Parser, Subcommand};
use recon_storage::{Page, StagingStore};
use recon_sync::{BulkPropagator, MatchStrategy, PropagateOperation, ReconConfig};

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Customer record reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the operator HTTP API.
    Serve,
    /// Create the reconciliation tables if they do not exist.
    CreateTables,
    /// Rank the staging table and match winners against the directory mirror.
    MatchRun {
        #[arg(long, default_value = "email-first")]
        strategy: String,
    },
    /// Run one bulk propagation operation over a paged window.
    Propagate {
        operation: String,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => recon_web::serve_from_env().await?,
        Commands::CreateTables => {
            let config = ReconConfig::from_env();
            let store = StagingStore::connect(&config.database_url).await?;
            store.create_tables().await?;
            println!("tables ready");
        }
        Commands::MatchRun { strategy } => {
            let strategy: MatchStrategy = strategy.parse()?;
            let config = ReconConfig::from_env();
            let store = StagingStore::connect(&config.database_url).await?;
            let summary = recon_sync::run_match(&store, strategy).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Propagate {
            operation,
            limit,
            offset,
            concurrency,
        } => {
            let operation: PropagateOperation = operation.parse()?;
            let config = ReconConfig::from_env();
            let store = StagingStore::connect(&config.database_url).await?;
            let propagator = BulkPropagator::from_config(store, &config)?;
            let summary = propagator
                .run(operation, Page::new(limit, offset), concurrency)
                .await?;
            println!(
                "operation={} scanned={} updated={} skipped={} failed={}",
                summary.operation, summary.scanned, summary.updated, summary.skipped, summary.failed
            );
            for file in &summary.log_files {
                println!("log: {file}");
            }
        }
    }
    Ok(())
}
