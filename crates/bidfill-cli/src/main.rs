use anyhow::{Context, Result};
use bidfill_core::{StreamId, Watermark};
use bidfill_storage::{connect_pool, run_migrations, PgWatermarkStore, WatermarkStore};
use bidfill_sync::{run_backfill, BackfillConfig, BackfillSummary, BucketSelection};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidfill")]
#[command(about = "Resumable day-bucket backfill of public procurement records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk day buckets oldest first, resuming from stored watermarks.
    Backfill(BackfillArgs),
    /// Print stored watermarks.
    Status {
        /// Only this stream, e.g. `notice:cnstwk`.
        #[arg(long)]
        stream: Option<StreamId>,
        /// Hide buckets that are fully fetched.
        #[arg(long)]
        incomplete: bool,
    },
    Migrate,
}

#[derive(Debug, Default, Args)]
struct BackfillArgs {
    /// Completed days before today; defaults to BACKFILL_DAYS.
    #[arg(long, conflicts_with_all = ["from", "dates"])]
    days: Option<u32>,
    #[arg(long, requires = "to", conflicts_with = "dates")]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
    /// Explicit buckets; repeatable.
    #[arg(long = "date")]
    dates: Vec<NaiveDate>,
    #[arg(long)]
    page_size: Option<u32>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl BackfillArgs {
    fn selection(&self, config: &BackfillConfig) -> BucketSelection {
        if !self.dates.is_empty() {
            return BucketSelection::Dates(self.dates.clone());
        }
        match (self.from, self.to) {
            (Some(from), Some(to)) => BucketSelection::Range { from, to },
            _ => BucketSelection::LastDays(self.days.unwrap_or(config.backfill_days)),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &BackfillSummary) {
    println!(
        "backfill {}: run_id={} buckets={} pages_ok={} pages_failed={} rows_persisted={} rows_dropped={} empty={} probe_failures={} early_stops={}",
        if summary.cancelled { "cancelled" } else { "complete" },
        summary.run_id,
        summary.buckets,
        summary.pages_completed,
        summary.pages_failed,
        summary.rows_persisted,
        summary.rows_dropped,
        summary.empty_buckets,
        summary.probe_failures,
        summary.early_stops,
    );
    for failed in &summary.failed_pages {
        println!(
            "  failed {} {} page {} after {} attempt(s){}: {}",
            failed.stream,
            failed.bucket,
            failed.page,
            failed.attempts,
            if failed.fatal { " (fatal)" } else { "" },
            failed.error
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let mut config = BackfillConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Backfill(BackfillArgs::default())) {
        Commands::Backfill(args) => {
            if let Some(page_size) = args.page_size {
                config.page_size = page_size.max(1);
            }
            let selection = args.selection(&config);
            let cancel = cancel_on_ctrl_c();
            let summary = run_backfill(&config, &selection, &cancel).await?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                print_summary(&summary);
            }
        }
        Commands::Status { stream, incomplete } => {
            let pool = connect_pool(&config.database_url, 1).await?;
            let store = PgWatermarkStore::new(pool);
            let stream = stream.map(|s| s.to_string());
            let rows = store.list(stream.as_deref()).await?;
            let page_size_of = |row: &Watermark| row.page_size.unwrap_or(config.page_size);
            for row in rows
                .iter()
                .filter(|row| !incomplete || !row.is_complete(page_size_of(row)))
            {
                let page_size = page_size_of(row);
                println!(
                    "{} {} pages={}/{} page_size={} records={} updated={}",
                    row.stream,
                    row.bucket,
                    row.last_page,
                    row.effective_total_pages(page_size),
                    page_size,
                    row.total_count.map_or_else(|| "?".to_string(), |c| c.to_string()),
                    row.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url, 1).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn explicit_dates_win_over_days() {
        let cli = Cli::parse_from(["bidfill", "backfill", "--date", "2025-03-01", "--date", "2025-03-03"]);
        let Some(Commands::Backfill(args)) = cli.command else {
            panic!("expected backfill");
        };
        assert_eq!(
            args.selection(&BackfillConfig::default()),
            BucketSelection::Dates(vec![date("2025-03-01"), date("2025-03-03")])
        );
    }

    #[test]
    fn range_and_default_days() {
        let cli = Cli::parse_from(["bidfill", "backfill", "--from", "2025-03-01", "--to", "2025-03-07"]);
        let Some(Commands::Backfill(args)) = cli.command else {
            panic!("expected backfill");
        };
        assert_eq!(
            args.selection(&BackfillConfig::default()),
            BucketSelection::Range {
                from: date("2025-03-01"),
                to: date("2025-03-07")
            }
        );

        let config = BackfillConfig {
            backfill_days: 30,
            ..BackfillConfig::default()
        };
        assert_eq!(BackfillArgs::default().selection(&config), BucketSelection::LastDays(30));
    }

    #[test]
    fn from_requires_to() {
        assert!(Cli::try_parse_from(["bidfill", "backfill", "--from", "2025-03-01"]).is_err());
    }

    #[test]
    fn status_parses_stream_ids() {
        let cli = Cli::parse_from(["bidfill", "status", "--stream", "prep:cnstwk", "--incomplete"]);
        let Some(Commands::Status { stream, incomplete }) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(stream.map(|s| s.to_string()).as_deref(), Some("prep15:cnstwk"));
        assert!(incomplete);
    }
}
