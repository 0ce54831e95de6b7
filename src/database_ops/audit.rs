//! Append-only audit of stage invocations.
//!
//! Every stage begins by inserting a `running` row and ends by closing it as
//! `completed` or `failed`. Stages run as separate time-boxed processes, so
//! this table (plus `pipeline_state`) is the only channel through which one
//! invocation can observe another.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::Row;
use tracing::info;

use crate::database_ops::db::Db;

#[derive(Debug, Default, Clone, Copy)]
pub struct RunTimings {
    pub download_ms: Option<i64>,
    pub convert_ms: Option<i64>,
    pub stage_ms: Option<i64>,
    pub merge_ms: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounts {
    pub rows_staged: Option<i64>,
    pub rows_updated: Option<i64>,
    pub history_upserted: Option<i64>,
}

/// Handle for one open audit row.
pub struct RunRecorder {
    id: i64,
    stage: String,
}

pub async fn begin_run(db: &Db, stage: &str, price_day: NaiveDate) -> Result<RunRecorder> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO price_ingestion_runs (stage, status, price_day)
         VALUES ($1, 'running', $2)
         RETURNING id",
    )
    .persistent(false)
    .bind(stage)
    .bind(price_day)
    .fetch_one(&db.pool)
    .await?;
    info!(stage, run_id = id, %price_day, "ingestion run started");
    Ok(RunRecorder {
        id,
        stage: stage.to_string(),
    })
}

impl RunRecorder {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn complete(
        &self,
        db: &Db,
        timings: RunTimings,
        counts: RunCounts,
        parse_mode: Option<&str>,
        fallback_triggered: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE price_ingestion_runs
             SET status = 'completed',
                 completed_at = now(),
                 download_ms = $2,
                 convert_ms = $3,
                 stage_ms = $4,
                 merge_ms = $5,
                 rows_staged = $6,
                 rows_updated = $7,
                 history_upserted = $8,
                 parse_mode = $9,
                 fallback_triggered = $10
             WHERE id = $1",
        )
        .persistent(false)
        .bind(self.id)
        .bind(timings.download_ms)
        .bind(timings.convert_ms)
        .bind(timings.stage_ms)
        .bind(timings.merge_ms)
        .bind(counts.rows_staged)
        .bind(counts.rows_updated)
        .bind(counts.history_upserted)
        .bind(parse_mode)
        .bind(fallback_triggered)
        .execute(&db.pool)
        .await?;
        info!(stage = %self.stage, run_id = self.id, "ingestion run completed");
        Ok(())
    }

    pub async fn fail(&self, db: &Db, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE price_ingestion_runs
             SET status = 'failed', completed_at = now(), error_message = $2
             WHERE id = $1",
        )
        .persistent(false)
        .bind(self.id)
        .bind(message)
        .execute(&db.pool)
        .await?;
        tracing::error!(stage = %self.stage, run_id = self.id, error = message, "ingestion run failed");
        Ok(())
    }
}

/// Status of the most recent run of any of `stages` that started within the
/// last `hours` hours, or None if there was no such run.
pub async fn latest_run_status_within(
    db: &Db,
    stages: &[&str],
    hours: i32,
) -> Result<Option<String>> {
    let stages: Vec<String> = stages.iter().map(|s| s.to_string()).collect();
    let row = sqlx::query(
        "SELECT status FROM price_ingestion_runs
         WHERE stage = ANY($1) AND started_at >= now() - make_interval(hours => $2)
         ORDER BY started_at DESC
         LIMIT 1",
    )
    .persistent(false)
    .bind(&stages)
    .bind(hours)
    .fetch_optional(&db.pool)
    .await?;
    Ok(match row {
        Some(r) => Some(r.try_get::<String, _>(0)?),
        None => None,
    })
}
