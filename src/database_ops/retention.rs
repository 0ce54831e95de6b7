//! Retention sweeper for `card_price_history`.
//!
//! Deletes rows strictly older than the retention window in bounded batches
//! with an inter-batch pause, so a sweep never holds long locks or issues one
//! oversized DELETE. Skips entirely unless the most recent merge run in the
//! last 24h completed.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::time::Duration;
use tracing::{info, warn};

use crate::database_ops::audit;
use crate::database_ops::db::Db;

#[derive(Debug, Default, Clone)]
pub struct SweepOutcome {
    pub skipped: Option<String>,
    pub rows_deleted: u64,
    pub batches: u32,
}

/// History rows with `price_day < cutoff` are deleted; the cutoff day itself
/// is retained.
pub fn retention_cutoff(today: NaiveDate, retention_days: i64) -> NaiveDate {
    today - ChronoDuration::days(retention_days)
}

pub async fn sweep_history(
    db: &Db,
    retention_days: i64,
    batch_rows: i64,
    pause_ms: u64,
    dry_run: bool,
) -> Result<SweepOutcome> {
    // a standalone merge and a full daily run both count as "yesterday ran"
    match audit::latest_run_status_within(db, &["merge", "full"], 24).await? {
        Some(status) if status == "completed" => {}
        Some(status) => {
            warn!(status, "retention skipped: most recent merge run did not complete");
            return Ok(SweepOutcome {
                skipped: Some(format!("most recent merge run status is '{status}'")),
                ..Default::default()
            });
        }
        None => {
            warn!("retention skipped: no merge run within the last 24h");
            return Ok(SweepOutcome {
                skipped: Some("no merge run within the last 24h".into()),
                ..Default::default()
            });
        }
    }

    let cutoff = retention_cutoff(chrono::Utc::now().date_naive(), retention_days);

    if dry_run {
        let candidates: i64 =
            sqlx::query_scalar("SELECT count(*) FROM card_price_history WHERE price_day < $1")
                .persistent(false)
                .bind(cutoff)
                .fetch_one(&db.pool)
                .await?;
        info!(%cutoff, candidates, "retention dry run");
        return Ok(SweepOutcome {
            skipped: None,
            rows_deleted: candidates as u64,
            batches: 0,
        });
    }

    let mut outcome = SweepOutcome::default();
    loop {
        let deleted = sqlx::query(
            "DELETE FROM card_price_history
             WHERE ctid IN (
                 SELECT ctid FROM card_price_history
                 WHERE price_day < $1
                 LIMIT $2
             )",
        )
        .persistent(false)
        .bind(cutoff)
        .bind(batch_rows)
        .execute(&db.pool)
        .await?
        .rows_affected();

        outcome.rows_deleted += deleted;
        outcome.batches += 1;
        info!(batch = outcome.batches, deleted, total = outcome.rows_deleted, "retention batch");

        if deleted < batch_rows as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }

    info!(%cutoff, rows_deleted = outcome.rows_deleted, batches = outcome.batches, "retention sweep complete");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_boundary_is_strict() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 6).unwrap();
        let cutoff = retention_cutoff(today, 30);
        let day = |n: i64| today - ChronoDuration::days(n);
        // price_day < cutoff is the delete predicate
        assert!(day(31) < cutoff, "31-day-old rows are deleted");
        assert!(!(day(30) < cutoff), "rows exactly at the window are retained");
        assert!(!(day(29) < cutoff), "29-day-old rows are retained");
    }
}
