//! Stage loader: truncate `card_price_staging`, then bulk-insert the
//! converter's CSV in bounded batches. Truncate-then-insert keeps the stage
//! safely re-runnable; it never appends.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use csv::{ByteRecord, ReaderBuilder};
use sqlx::QueryBuilder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database_ops::db::Db;

#[derive(Debug, Clone)]
pub struct StagedRow {
    pub id: Uuid,
    pub price_a: Option<BigDecimal>,
    pub price_b: Option<BigDecimal>,
    pub price_c: Option<BigDecimal>,
    pub price_day: NaiveDate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageOutcome {
    pub rows_staged: u64,
    pub rows_skipped: u64,
    pub elapsed_ms: u64,
}

struct HeaderIndex {
    id: usize,
    price_a: usize,
    price_b: usize,
    price_c: usize,
    price_day: usize,
}

fn header_index(headers: &ByteRecord) -> Result<HeaderIndex> {
    let find = |name: &[u8]| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("{} col missing", String::from_utf8_lossy(name)))
    };
    Ok(HeaderIndex {
        id: find(b"id")?,
        price_a: find(b"price_a")?,
        price_b: find(b"price_b")?,
        price_c: find(b"price_c")?,
        price_day: find(b"price_day")?,
    })
}

fn parse_optional_price(raw: &[u8]) -> Result<Option<BigDecimal>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let s = std::str::from_utf8(raw)?;
    Ok(Some(s.parse::<BigDecimal>()?))
}

fn parse_staging_record(rec: &ByteRecord, idx: &HeaderIndex) -> Result<StagedRow> {
    let id = Uuid::parse_str(std::str::from_utf8(&rec[idx.id])?)?;
    let price_day =
        NaiveDate::parse_from_str(std::str::from_utf8(&rec[idx.price_day])?, "%Y-%m-%d")?;
    Ok(StagedRow {
        id,
        price_a: parse_optional_price(&rec[idx.price_a])?,
        price_b: parse_optional_price(&rec[idx.price_b])?,
        price_c: parse_optional_price(&rec[idx.price_c])?,
        price_day,
    })
}

async fn insert_batch(db: &Db, rows: &[StagedRow]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO card_price_staging (id, price_a, price_b, price_c, price_day) ",
    );
    qb.push_values(rows, |mut b, r| {
        b.push_bind(r.id)
            .push_bind(r.price_a.as_ref())
            .push_bind(r.price_b.as_ref())
            .push_bind(r.price_c.as_ref())
            .push_bind(r.price_day);
    });
    // The feed is keyed by card id; a duplicate inside one file is a feed bug
    // we tolerate rather than abort the whole batch on.
    qb.push(" ON CONFLICT (id) DO NOTHING");
    let result = qb.build().persistent(false).execute(&db.pool).await?;
    Ok(result.rows_affected())
}

/// Load `csv_path` into the staging table. With `dry_run` the CSV is parsed
/// and counted but the database is never touched.
pub async fn load_staging_csv(
    db: &Db,
    csv_path: &Path,
    batch_size: usize,
    dry_run: bool,
) -> Result<StageOutcome> {
    let started = Instant::now();
    let file = File::open(csv_path).with_context(|| format!("open staging csv {csv_path:?}"))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(BufReader::with_capacity(8 << 20, file));

    let headers = rdr.byte_headers()?.clone();
    let idx = header_index(&headers)?;

    if !dry_run {
        sqlx::raw_sql("TRUNCATE card_price_staging")
            .execute(&db.pool)
            .await?;
    }

    let mut rec = ByteRecord::new();
    let mut batch: Vec<StagedRow> = Vec::with_capacity(batch_size);
    let mut outcome = StageOutcome::default();
    let mut row_no: u64 = 0;

    while rdr.read_byte_record(&mut rec)? {
        row_no += 1;
        match parse_staging_record(&rec, &idx) {
            Ok(row) => batch.push(row),
            Err(e) => {
                warn!(row = row_no, error = %e, "skipping unparseable staging row");
                outcome.rows_skipped += 1;
            }
        }
        if batch.len() >= batch_size {
            outcome.rows_staged += if dry_run {
                batch.len() as u64
            } else {
                insert_batch(db, &batch).await?
            };
            batch.clear();
        }
        rec.clear();
    }
    if !batch.is_empty() {
        outcome.rows_staged += if dry_run {
            batch.len() as u64
        } else {
            insert_batch(db, &batch).await?
        };
    }

    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        rows_staged = outcome.rows_staged,
        rows_skipped = outcome.rows_skipped,
        elapsed_ms = outcome.elapsed_ms,
        dry_run,
        "staging load complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> ByteRecord {
        let mut rec = ByteRecord::new();
        for f in fields {
            rec.push_field(f.as_bytes());
        }
        rec
    }

    fn index() -> HeaderIndex {
        header_index(&record(&["id", "price_a", "price_b", "price_c", "price_day"])).unwrap()
    }

    #[test]
    fn parses_full_row() {
        let rec = record(&[
            "6f2dd1d8-72f1-4f56-9077-85e0e4e178d8",
            "1.23",
            "4.50",
            "",
            "2026-08-06",
        ]);
        let row = parse_staging_record(&rec, &index()).unwrap();
        assert_eq!(row.price_a, Some("1.23".parse().unwrap()));
        assert_eq!(row.price_b, Some("4.50".parse().unwrap()));
        assert!(row.price_c.is_none());
        assert_eq!(row.price_day, NaiveDate::from_ymd_opt(2026, 8, 6).unwrap());
    }

    #[test]
    fn empty_fields_become_null() {
        let rec = record(&["6f2dd1d8-72f1-4f56-9077-85e0e4e178d8", "", "", "", "2026-08-06"]);
        let row = parse_staging_record(&rec, &index()).unwrap();
        assert!(row.price_a.is_none() && row.price_b.is_none() && row.price_c.is_none());
    }

    #[test]
    fn rejects_bad_uuid_and_date() {
        let idx = index();
        assert!(parse_staging_record(&record(&["nope", "", "", "", "2026-08-06"]), &idx).is_err());
        assert!(parse_staging_record(
            &record(&["6f2dd1d8-72f1-4f56-9077-85e0e4e178d8", "", "", "", "08/06/2026"]),
            &idx
        )
        .is_err());
    }

    #[test]
    fn missing_header_is_an_error() {
        let headers = record(&["id", "price_a", "price_b", "price_day"]);
        assert!(header_index(&headers).is_err());
    }
}
