//! Consistency gate between staging and merge.
//!
//! A partially-downloaded or mis-filtered feed would silently overwrite
//! current prices for a large fraction of cards. Comparing the staged row
//! count against the destination card count makes that failure mode loud
//! and non-destructive: the decision is persisted and the merge simply does
//! not run when it is a deny.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::Row;
use tracing::{info, warn};

use crate::database_ops::db::Db;

pub const KEY_STAGE_ALLOWED: &str = "stage_allowed";
pub const KEY_STAGE_RATIO: &str = "stage_ratio";

#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub allowed: bool,
    pub ratio: f64,
    pub rows_staged: i64,
    pub card_count: i64,
}

/// Pure ratio check. A non-positive destination count denies outright.
pub fn evaluate_ratio(rows_staged: i64, card_count: i64, lo: f64, hi: f64) -> (bool, f64) {
    if card_count <= 0 {
        return (false, 0.0);
    }
    let ratio = rows_staged as f64 / card_count as f64;
    (ratio >= lo && ratio <= hi, ratio)
}

pub async fn evaluate_and_persist(
    db: &Db,
    price_day: NaiveDate,
    bounds: (f64, f64),
    dry_run: bool,
) -> Result<GateDecision> {
    let (lo, hi) = bounds;
    let rows_staged: i64 = sqlx::query_scalar("SELECT count(*) FROM card_price_staging")
        .persistent(false)
        .fetch_one(&db.pool)
        .await?;
    let card_count: i64 = sqlx::query_scalar("SELECT count(*) FROM cards")
        .persistent(false)
        .fetch_one(&db.pool)
        .await?;
    let (allowed, ratio) = evaluate_ratio(rows_staged, card_count, lo, hi);

    if allowed {
        info!(rows_staged, card_count, ratio, lo, hi, "gate allows merge");
    } else {
        warn!(rows_staged, card_count, ratio, lo, hi, "gate denies merge");
    }

    if !dry_run {
        set_state(db, KEY_STAGE_ALLOWED, Some(allowed), None, price_day).await?;
        set_state(db, KEY_STAGE_RATIO, None, Some(ratio), price_day).await?;
    }

    Ok(GateDecision {
        allowed,
        ratio,
        rows_staged,
        card_count,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct StateEntry {
    pub bool_value: Option<bool>,
    pub float_value: Option<f64>,
    pub as_of_date: NaiveDate,
}

pub async fn get_state(db: &Db, key: &str) -> Result<Option<StateEntry>> {
    let row = sqlx::query(
        "SELECT bool_value, float_value, as_of_date FROM pipeline_state WHERE key = $1",
    )
    .persistent(false)
    .bind(key)
    .fetch_optional(&db.pool)
    .await?;
    Ok(match row {
        Some(r) => Some(StateEntry {
            bool_value: r.try_get(0)?,
            float_value: r.try_get(1)?,
            as_of_date: r.try_get(2)?,
        }),
        None => None,
    })
}

async fn set_state(
    db: &Db,
    key: &str,
    bool_value: Option<bool>,
    float_value: Option<f64>,
    as_of_date: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO pipeline_state (key, bool_value, float_value, as_of_date, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (key) DO UPDATE
         SET bool_value = EXCLUDED.bool_value,
             float_value = EXCLUDED.float_value,
             as_of_date = EXCLUDED.as_of_date,
             updated_at = now()",
    )
    .persistent(false)
    .bind(key)
    .bind(bool_value)
    .bind(float_value)
    .bind(as_of_date)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_bounds() {
        let (allowed, ratio) = evaluate_ratio(95, 100, 0.90, 1.10);
        assert!(allowed);
        assert!((ratio - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn denies_below_lower_bound() {
        let (allowed, _) = evaluate_ratio(50, 100, 0.90, 1.10);
        assert!(!allowed);
    }

    #[test]
    fn denies_above_upper_bound() {
        let (allowed, _) = evaluate_ratio(150, 100, 0.90, 1.10);
        assert!(!allowed);
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(evaluate_ratio(90, 100, 0.90, 1.10).0);
        assert!(evaluate_ratio(110, 100, 0.90, 1.10).0);
    }

    #[test]
    fn empty_destination_denies() {
        let (allowed, ratio) = evaluate_ratio(100, 0, 0.90, 1.10);
        assert!(!allowed);
        assert_eq!(ratio, 0.0);
    }
}
