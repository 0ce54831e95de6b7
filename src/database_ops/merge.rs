//! Merge engine: one transaction carrying a set-based UPDATE of current card
//! prices plus the per-day history upsert. Either both land or neither does.
//!
//! The merge refuses to run unless the persisted gate decision exists for the
//! run's price day and allows it; a stale decision from a previous day counts
//! as missing.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::database_ops::db::Db;
use crate::database_ops::gate;

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Reason the merge did not run; None when it executed.
    pub skipped: Option<String>,
    pub rows_updated: u64,
    pub history_upserted: u64,
}

impl MergeOutcome {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            rows_updated: 0,
            history_upserted: 0,
        }
    }
}

const UPDATE_CURRENT_SQL: &str = "\
    UPDATE cards c
       SET price_usd = s.price_a,
           price_usd_foil = s.price_b,
           price_usd_etched = s.price_c,
           prices_updated_at = now()
      FROM card_price_staging s
     WHERE c.id = s.id";

// Three branches, one per finish. The join against cards keeps staged ids the
// storefront has never seen out of the history table.
const UPSERT_HISTORY_SQL: &str = "\
    INSERT INTO card_price_history (card_id, finish, price, recorded_at, source, price_day)
    SELECT s.id, 'nonfoil', s.price_a, now(), $1, s.price_day
      FROM card_price_staging s JOIN cards c ON c.id = s.id
     WHERE s.price_a IS NOT NULL
    UNION ALL
    SELECT s.id, 'foil', s.price_b, now(), $1, s.price_day
      FROM card_price_staging s JOIN cards c ON c.id = s.id
     WHERE s.price_b IS NOT NULL
    UNION ALL
    SELECT s.id, 'etched', s.price_c, now(), $1, s.price_day
      FROM card_price_staging s JOIN cards c ON c.id = s.id
     WHERE s.price_c IS NOT NULL
    ON CONFLICT (card_id, finish, price_day) DO UPDATE
       SET price = EXCLUDED.price,
           recorded_at = EXCLUDED.recorded_at,
           source = EXCLUDED.source";

/// Counts the transaction would touch, without executing it.
pub async fn dry_run_counts(db: &Db) -> Result<MergeOutcome> {
    let would_update: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM card_price_staging s JOIN cards c ON c.id = s.id",
    )
    .persistent(false)
    .fetch_one(&db.pool)
    .await?;
    let would_upsert: i64 = sqlx::query_scalar(
        "SELECT count(*) FILTER (WHERE s.price_a IS NOT NULL)
              + count(*) FILTER (WHERE s.price_b IS NOT NULL)
              + count(*) FILTER (WHERE s.price_c IS NOT NULL)
         FROM card_price_staging s JOIN cards c ON c.id = s.id",
    )
    .persistent(false)
    .fetch_one(&db.pool)
    .await?;
    info!(would_update, would_upsert, "merge dry run");
    Ok(MergeOutcome {
        skipped: None,
        rows_updated: would_update as u64,
        history_upserted: would_upsert as u64,
    })
}

pub async fn merge_staged_prices(
    db: &Db,
    price_day: NaiveDate,
    source: &str,
    dry_run: bool,
) -> Result<MergeOutcome> {
    let Some(state) = gate::get_state(db, gate::KEY_STAGE_ALLOWED).await? else {
        warn!("merge skipped: no gate decision recorded");
        return Ok(MergeOutcome::skip("no gate decision recorded"));
    };
    if state.as_of_date != price_day {
        warn!(gate_day = %state.as_of_date, %price_day, "merge skipped: stale gate decision");
        return Ok(MergeOutcome::skip(format!(
            "gate decision is for {}, not {}",
            state.as_of_date, price_day
        )));
    }
    if state.bool_value != Some(true) {
        warn!(%price_day, "merge skipped: gate denied staged volume");
        return Ok(MergeOutcome::skip("gate denied staged volume"));
    }

    if dry_run {
        return dry_run_counts(db).await;
    }

    let mut tx = db.pool.begin().await.context("begin merge transaction")?;
    let rows_updated = sqlx::query(UPDATE_CURRENT_SQL)
        .persistent(false)
        .execute(&mut *tx)
        .await
        .context("update current card prices")?
        .rows_affected();
    let history_upserted = sqlx::query(UPSERT_HISTORY_SQL)
        .persistent(false)
        .bind(source)
        .execute(&mut *tx)
        .await
        .context("upsert price history")?
        .rows_affected();
    tx.commit().await.context("commit merge transaction")?;

    info!(rows_updated, history_upserted, %price_day, "merge committed");
    Ok(MergeOutcome {
        skipped: None,
        rows_updated,
        history_upserted,
    })
}
