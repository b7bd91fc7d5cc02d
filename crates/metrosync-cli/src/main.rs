use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrosync_core::AuditEntry;
use metrosync_storage::{AuditLog, AuditSummary};
use metrosync_sync::{audit_log_path_from_env, build_pipeline, SyncConfig, UnsavedAuditLog};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "metrosync-cli")]
#[command(about = "Upsert metro-area sheet rows into Salesforce")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, clean and upsert every row, then save the audit log.
    Sync(SyncArgs),
    /// Print the saved audit entries for one metro id.
    Logs {
        #[arg(long)]
        metro_id: u64,
        /// Audit log to read; defaults to METROSYNC_AUDIT_LOG.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    batch_size: Option<NonZeroUsize>,
    /// Where to write the audit log.
    #[arg(long)]
    output: Option<PathBuf>,
    /// After the run, print the entries for this metro id.
    #[arg(long)]
    show_metro_id: Option<u64>,
    /// Upsert into an empty in-memory CRM instead of Salesforce.
    #[arg(long)]
    dry_run: bool,
}

fn print_entries(metro_id: u64, entries: &[&AuditEntry]) -> Result<()> {
    println!("\nlogs for metro id {metro_id}:");
    println!(
        "{}",
        serde_json::to_string_pretty(entries).context("serializing audit entries")?
    );
    Ok(())
}

fn print_summary(summary: &AuditSummary) {
    println!(
        "processing complete: {} records processed (created={} updated={} failed={})",
        summary.processed, summary.created, summary.updated, summary.failed
    );
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env()?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(output) = args.output {
        config.audit_log_path = output;
    }

    let pipeline = build_pipeline(config, args.dry_run).await?;
    let run = match pipeline.run_once().await {
        Ok(run) => run,
        Err(err) => {
            if let Some(unsaved) = err.downcast_ref::<UnsavedAuditLog>() {
                print_summary(&unsaved.log.summary());
                eprintln!(
                    "audit log not saved to {}; entries follow",
                    unsaved.path.display()
                );
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(unsaved.log.entries())
                        .context("serializing audit entries")?
                );
            }
            return Err(err);
        }
    };
    print_summary(&run.log.summary());
    println!("logs saved to {}", run.summary.audit_log_path);

    if let Some(metro_id) = args.show_metro_id {
        print_entries(metro_id, &run.log.entries_by_sequence_id(metro_id))?;
    }
    Ok(())
}

async fn logs(metro_id: u64, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(audit_log_path_from_env);
    let log = AuditLog::load(&path).await?;
    print_entries(metro_id, &log.entries_by_sequence_id(metro_id))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metrosync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Logs { metro_id, path } => logs(metro_id, path).await?,
    }

    Ok(())
}
