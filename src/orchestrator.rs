//! Daily pipeline composition: resolve -> convert -> stage -> gate -> merge.
//!
//! Each stage stays independently invocable through the CLI; this module is
//! the single-invocation convenience for the scheduler. Per-stage timings and
//! counts are folded into one `full` audit row. Cross-invocation state still
//! travels only through `pipeline_state` and `price_ingestion_runs`.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use crate::config::PipelineConfig;
use crate::database_ops::audit::{self, RunCounts, RunTimings};
use crate::database_ops::db::Db;
use crate::database_ops::gate::{self, GateDecision};
use crate::database_ops::merge::{self, MergeOutcome};
use crate::database_ops::staging::{self, StageOutcome};
use crate::feed::convert::{convert_feed, ConvertOutcome, ConvertSettings, FeedSource};
use crate::feed::resolver;

#[derive(Debug)]
pub struct DailySummary {
    pub price_day: NaiveDate,
    pub convert: ConvertOutcome,
    pub staged: StageOutcome,
    pub gate: GateDecision,
    pub merge: MergeOutcome,
}

pub async fn run_daily(
    cfg: &PipelineConfig,
    db: &Db,
    source: Option<FeedSource>,
    price_day: NaiveDate,
    dry_run: bool,
) -> Result<DailySummary> {
    let recorder = if dry_run {
        None
    } else {
        Some(audit::begin_run(db, "full", price_day).await?)
    };

    match run_stages(cfg, db, source, price_day, dry_run).await {
        Ok((summary, timings)) => {
            if let Some(rec) = recorder {
                rec.complete(
                    db,
                    timings,
                    RunCounts {
                        rows_staged: Some(summary.staged.rows_staged as i64),
                        rows_updated: Some(summary.merge.rows_updated as i64),
                        history_upserted: Some(summary.merge.history_upserted as i64),
                    },
                    Some(summary.convert.parse_mode),
                    Some(summary.convert.fallback_triggered),
                )
                .await?;
            }
            Ok(summary)
        }
        Err(e) => {
            if let Some(rec) = recorder {
                // the audit write must not mask the original failure
                let _ = rec.fail(db, &format!("{e:#}")).await;
            }
            Err(e)
        }
    }
}

async fn run_stages(
    cfg: &PipelineConfig,
    db: &Db,
    source: Option<FeedSource>,
    price_day: NaiveDate,
    dry_run: bool,
) -> Result<(DailySummary, RunTimings)> {
    let mut timings = RunTimings::default();

    let resolve_started = Instant::now();
    let source = match source {
        Some(src) => src,
        None => {
            let resolved = resolver::resolve_feed(cfg).await.context("resolve feed")?;
            FeedSource::Url(resolved.url)
        }
    };
    timings.download_ms = Some(resolve_started.elapsed().as_millis() as i64);

    info!(source = %source.describe(), %price_day, "daily price run: converting");
    let out_path = cfg.work_dir.join(format!("card-prices-{price_day}.csv"));
    let convert_started = Instant::now();
    let settings = ConvertSettings::from_config(cfg, price_day);
    let convert = convert_feed(&settings, &source, &out_path)
        .await
        .context("convert feed")?;
    timings.convert_ms = Some(convert_started.elapsed().as_millis() as i64);

    info!(csv = %out_path.display(), "daily price run: staging");
    let stage_started = Instant::now();
    let staged = staging::load_staging_csv(db, &out_path, cfg.stage_batch_size, dry_run)
        .await
        .context("load staging table")?;
    timings.stage_ms = Some(stage_started.elapsed().as_millis() as i64);

    info!("daily price run: evaluating gate");
    let gate = gate::evaluate_and_persist(db, price_day, cfg.gate_bounds(), dry_run)
        .await
        .context("evaluate consistency gate")?;

    // Dry runs persist no gate decision, so answer from the in-hand one
    // instead of the (missing or stale) persisted state.
    let merge = if dry_run {
        if gate.allowed {
            merge::dry_run_counts(db).await.context("merge dry run")?
        } else {
            MergeOutcome {
                skipped: Some("gate denied staged volume".into()),
                rows_updated: 0,
                history_upserted: 0,
            }
        }
    } else {
        info!("daily price run: merging");
        let merge_started = Instant::now();
        let merge = merge::merge_staged_prices(db, price_day, &cfg.feed_source, false)
            .await
            .context("merge staged prices")?;
        timings.merge_ms = Some(merge_started.elapsed().as_millis() as i64);
        merge
    };

    match &merge.skipped {
        Some(reason) => info!(reason, "daily price run finished without merging"),
        None => info!(
            rows_updated = merge.rows_updated,
            history_upserted = merge.history_upserted,
            "daily price run complete"
        ),
    }

    Ok((
        DailySummary {
            price_day,
            convert,
            staged,
            gate,
            merge,
        },
        timings,
    ))
}
