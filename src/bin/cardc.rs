use anyhow::Result;
use cardcompare::config::PipelineConfig;
use cardcompare::database_ops::audit::{self, RunCounts, RunTimings};
use cardcompare::database_ops::db::Db;
use cardcompare::database_ops::{gate, merge, retention, staging};
use cardcompare::feed::convert::{convert_feed, ConvertSettings, FeedSource};
use cardcompare::feed::resolver;
use cardcompare::orchestrator;
use cardcompare::telemetry;
use cardcompare::util::env as env_util;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "cardc", version, about = "CardCompare pricing pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Resolve the day's bulk download URL from the provider metadata endpoint
    ResolveFeed,
    /// Convert a bulk JSON feed into the staging CSV
    Convert {
        /// Read the feed from a local file instead of downloading
        #[arg(long, conflicts_with = "url")]
        file: Option<PathBuf>,
        /// Download the feed from an explicit URL (skips metadata discovery)
        #[arg(long)]
        url: Option<String>,
        /// Output CSV path (defaults to the work dir)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Price day stamped on every row (defaults to today, UTC)
        #[arg(long)]
        price_day: Option<NaiveDate>,
        /// Produce the CSV but write no audit row
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Load a converted CSV into the staging table (truncate-then-insert)
    Stage {
        /// The converter's CSV output
        #[arg(long)]
        file: PathBuf,
        /// Price day for the audit row (defaults to today, UTC)
        #[arg(long)]
        price_day: Option<NaiveDate>,
        /// Parse and count the CSV without touching the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Compare staged rows against the card population and persist the decision
    Gate {
        /// Price day the decision is keyed to (defaults to today, UTC)
        #[arg(long)]
        price_day: Option<NaiveDate>,
        /// Compute and print the ratio without persisting it
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Merge staged prices into current card prices and per-day history
    Merge {
        /// Price day the gate decision must match (defaults to today, UTC)
        #[arg(long)]
        price_day: Option<NaiveDate>,
        /// Report would-be row counts without mutating
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Delete history rows older than the retention window
    Retention {
        /// Count candidate rows without deleting
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Full daily cycle: resolve, convert, stage, gate, merge
    Run {
        /// Read the feed from a local file instead of downloading
        #[arg(long, conflicts_with = "url")]
        file: Option<PathBuf>,
        /// Download the feed from an explicit URL (skips metadata discovery)
        #[arg(long)]
        url: Option<String>,
        /// Price day for the whole cycle (defaults to today, UTC)
        #[arg(long)]
        price_day: Option<NaiveDate>,
        /// Validate the cycle without mutating the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Print row counts for the pipeline's tables
    DbCounts,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn pick_source(file: Option<PathBuf>, url: Option<String>) -> Option<FeedSource> {
    match (file, url) {
        (Some(path), _) => Some(FeedSource::File(path)),
        (None, Some(url)) => Some(FeedSource::Url(url)),
        (None, None) => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    telemetry::init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();
    let cfg = PipelineConfig::from_env()?;

    match cli.command {
        Commands::ResolveFeed => {
            let resolved = resolver::resolve_feed(&cfg).await?;
            println!("{}", resolved.url);
            if let Some(size) = resolved.size {
                println!("size: {size} bytes");
            }
            if let Some(updated_at) = resolved.updated_at {
                println!("updated_at: {updated_at}");
            }
        }
        Commands::Convert {
            file,
            url,
            out,
            price_day,
            dry_run,
        } => {
            let price_day = price_day.unwrap_or_else(today);
            let source = match pick_source(file, url) {
                Some(src) => src,
                None => FeedSource::Url(resolver::resolve_feed(&cfg).await?.url),
            };
            let out_path = out.unwrap_or_else(|| {
                cfg.work_dir.join(format!("card-prices-{price_day}.csv"))
            });
            let settings = ConvertSettings::from_config(&cfg, price_day);

            if dry_run {
                let outcome = convert_feed(&settings, &source, &out_path).await?;
                print_convert(&outcome, &out_path);
                return Ok(());
            }

            let db = Db::connect_no_migrate(&cfg.database_url, cfg.db_max_connections).await?;
            let rec = audit::begin_run(&db, "convert", price_day).await?;
            let started = Instant::now();
            match convert_feed(&settings, &source, &out_path).await {
                Ok(outcome) => {
                    rec.complete(
                        &db,
                        RunTimings {
                            convert_ms: Some(started.elapsed().as_millis() as i64),
                            ..Default::default()
                        },
                        RunCounts {
                            rows_staged: Some(outcome.rows_written as i64),
                            ..Default::default()
                        },
                        Some(outcome.parse_mode),
                        Some(outcome.fallback_triggered),
                    )
                    .await?;
                    print_convert(&outcome, &out_path);
                }
                Err(e) => {
                    let _ = rec.fail(&db, &format!("{e:#}")).await;
                    return Err(e);
                }
            }
        }
        Commands::Stage {
            file,
            price_day,
            dry_run,
        } => {
            let price_day = price_day.unwrap_or_else(today);
            let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
            if dry_run {
                let outcome = staging::load_staging_csv(&db, &file, cfg.stage_batch_size, true).await?;
                println!(
                    "dry run: {} rows parsed, {} skipped",
                    outcome.rows_staged, outcome.rows_skipped
                );
                return Ok(());
            }
            let rec = audit::begin_run(&db, "stage", price_day).await?;
            match staging::load_staging_csv(&db, &file, cfg.stage_batch_size, false).await {
                Ok(outcome) => {
                    rec.complete(
                        &db,
                        RunTimings {
                            stage_ms: Some(outcome.elapsed_ms as i64),
                            ..Default::default()
                        },
                        RunCounts {
                            rows_staged: Some(outcome.rows_staged as i64),
                            ..Default::default()
                        },
                        None,
                        None,
                    )
                    .await?;
                    println!(
                        "staged {} rows in {}ms ({} skipped)",
                        outcome.rows_staged, outcome.elapsed_ms, outcome.rows_skipped
                    );
                }
                Err(e) => {
                    let _ = rec.fail(&db, &format!("{e:#}")).await;
                    return Err(e);
                }
            }
        }
        Commands::Gate { price_day, dry_run } => {
            let price_day = price_day.unwrap_or_else(today);
            let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
            let decision = if dry_run {
                gate::evaluate_and_persist(&db, price_day, cfg.gate_bounds(), true).await?
            } else {
                let rec = audit::begin_run(&db, "gate", price_day).await?;
                match gate::evaluate_and_persist(&db, price_day, cfg.gate_bounds(), false).await {
                    Ok(decision) => {
                        rec.complete(
                            &db,
                            RunTimings::default(),
                            RunCounts {
                                rows_staged: Some(decision.rows_staged),
                                ..Default::default()
                            },
                            None,
                            None,
                        )
                        .await?;
                        decision
                    }
                    Err(e) => {
                        let _ = rec.fail(&db, &format!("{e:#}")).await;
                        return Err(e);
                    }
                }
            };
            println!(
                "{}: ratio {:.4} ({} staged / {} cards)",
                if decision.allowed { "ALLOW" } else { "DENY" },
                decision.ratio,
                decision.rows_staged,
                decision.card_count
            );
        }
        Commands::Merge { price_day, dry_run } => {
            let price_day = price_day.unwrap_or_else(today);
            let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
            if dry_run {
                let outcome = merge::merge_staged_prices(&db, price_day, &cfg.feed_source, true).await?;
                print_merge(&outcome, true);
                return Ok(());
            }
            let rec = audit::begin_run(&db, "merge", price_day).await?;
            let started = Instant::now();
            match merge::merge_staged_prices(&db, price_day, &cfg.feed_source, false).await {
                Ok(outcome) => {
                    rec.complete(
                        &db,
                        RunTimings {
                            merge_ms: Some(started.elapsed().as_millis() as i64),
                            ..Default::default()
                        },
                        RunCounts {
                            rows_updated: Some(outcome.rows_updated as i64),
                            history_upserted: Some(outcome.history_upserted as i64),
                            ..Default::default()
                        },
                        None,
                        None,
                    )
                    .await?;
                    print_merge(&outcome, false);
                }
                Err(e) => {
                    let _ = rec.fail(&db, &format!("{e:#}")).await;
                    return Err(e);
                }
            }
        }
        Commands::Retention { dry_run } => {
            let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
            if dry_run {
                let outcome = retention::sweep_history(
                    &db,
                    cfg.retention_days,
                    cfg.retention_batch_rows,
                    cfg.retention_pause_ms,
                    true,
                )
                .await?;
                match outcome.skipped {
                    Some(reason) => println!("skipped: {reason}"),
                    None => println!("dry run: {} rows past retention", outcome.rows_deleted),
                }
                return Ok(());
            }
            let rec = audit::begin_run(&db, "retention", today()).await?;
            match retention::sweep_history(
                &db,
                cfg.retention_days,
                cfg.retention_batch_rows,
                cfg.retention_pause_ms,
                false,
            )
            .await
            {
                Ok(outcome) => {
                    rec.complete(&db, RunTimings::default(), RunCounts::default(), None, None)
                        .await?;
                    match outcome.skipped {
                        Some(reason) => println!("skipped: {reason}"),
                        None => println!(
                            "deleted {} rows in {} batches",
                            outcome.rows_deleted, outcome.batches
                        ),
                    }
                }
                Err(e) => {
                    let _ = rec.fail(&db, &format!("{e:#}")).await;
                    return Err(e);
                }
            }
        }
        Commands::Run {
            file,
            url,
            price_day,
            dry_run,
        } => {
            let price_day = price_day.unwrap_or_else(today);
            let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
            let summary =
                orchestrator::run_daily(&cfg, &db, pick_source(file, url), price_day, dry_run)
                    .await?;
            println!(
                "converted {} rows ({} filtered, mode {}{}), staged {}",
                summary.convert.rows_written,
                summary.convert.rows_filtered,
                summary.convert.parse_mode,
                if summary.convert.fallback_triggered {
                    ", fallback"
                } else {
                    ""
                },
                summary.staged.rows_staged
            );
            println!(
                "gate {}: ratio {:.4}",
                if summary.gate.allowed { "ALLOW" } else { "DENY" },
                summary.gate.ratio
            );
            print_merge(&summary.merge, dry_run);
        }
        Commands::DbCounts => {
            let db = Db::connect_no_migrate(&cfg.database_url, cfg.db_max_connections).await?;
            for table in [
                "cards",
                "card_price_staging",
                "card_price_history",
                "pipeline_state",
                "price_ingestion_runs",
            ] {
                match db.table_count(table).await {
                    Ok(count) => println!("{table:>24}: {count}"),
                    Err(e) => println!("{table:>24}: unavailable ({e})"),
                }
            }
        }
    }
    Ok(())
}

fn print_convert(outcome: &cardcompare::feed::convert::ConvertOutcome, out_path: &std::path::Path) {
    println!(
        "wrote {} rows to {} ({} in source, {} filtered, mode {}{})",
        outcome.rows_written,
        out_path.display(),
        outcome.rows_in_source,
        outcome.rows_filtered,
        outcome.parse_mode,
        if outcome.fallback_triggered {
            ", fallback"
        } else {
            ""
        }
    );
}

fn print_merge(outcome: &merge::MergeOutcome, dry_run: bool) {
    match &outcome.skipped {
        Some(reason) => println!("merge skipped: {reason}"),
        None if dry_run => println!(
            "dry run: would update {} cards, upsert {} history rows",
            outcome.rows_updated, outcome.history_upserted
        ),
        None => println!(
            "updated {} cards, upserted {} history rows",
            outcome.rows_updated, outcome.history_upserted
        ),
    }
}
