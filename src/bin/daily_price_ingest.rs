//! Scheduler entry point: one full daily cycle with discovery via the bulk
//! metadata endpoint. Equivalent to `cardc run` with no source override.

use anyhow::Result;
use cardcompare::config::PipelineConfig;
use cardcompare::database_ops::db::Db;
use cardcompare::orchestrator;
use cardcompare::telemetry;
use cardcompare::util::env as env_util;

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    telemetry::init_tracing("info,sqlx=warn")?;
    env_util::preflight_check(
        "daily_price_ingest",
        &[],
        &[
            "DATABASE_URL",
            "FEED_URL",
            "FEED_META_URL",
            "FEED_DATASET",
            "FEED_PAPER_ONLY",
            "FEED_PARSE_MODE",
            "GATE_RATIO_MIN",
            "GATE_RATIO_MAX",
        ],
    )?;

    let cfg = PipelineConfig::from_env()?;
    let db = Db::connect(&cfg.database_url, cfg.db_max_connections).await?;
    let price_day = chrono::Utc::now().date_naive();

    let summary = orchestrator::run_daily(&cfg, &db, None, price_day, false).await?;
    match &summary.merge.skipped {
        Some(reason) => println!("{price_day}: merge skipped ({reason})"),
        None => println!(
            "{price_day}: updated {} cards, upserted {} history rows",
            summary.merge.rows_updated, summary.merge.history_upserted
        ),
    }
    Ok(())
}
