//! Stream converter: bulk JSON feed -> staging CSV.
//!
//! The streaming path never materializes the parsed document; the scanner
//! delimits one object at a time out of the byte stream. A watchdog tracks
//! the last successfully written row and, in auto mode, a stall aborts the
//! attempt, discards the partial CSV, and re-acquires the source for a
//! one-shot buffered parse through the same per-record transform.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_compression::tokio::bufread::GzipDecoder;
use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::config::{ParseMode, PipelineConfig};
use crate::feed::record::{self, CardRecord, RecordFilter, CSV_HEADER};
use crate::feed::scan::ObjectScanner;

#[derive(Debug, Clone)]
pub enum FeedSource {
    Url(String),
    File(PathBuf),
}

impl FeedSource {
    pub fn describe(&self) -> String {
        match self {
            FeedSource::Url(u) => u.clone(),
            FeedSource::File(p) => p.display().to_string(),
        }
    }

    // reqwest transparently inflates Content-Encoding responses; this is for
    // sources that are .gz objects in their own right.
    fn is_gzip(&self) -> bool {
        match self {
            FeedSource::File(p) => p.extension().is_some_and(|e| e == "gz"),
            FeedSource::Url(u) => url::Url::parse(u)
                .map(|u| u.path().ends_with(".gz"))
                .unwrap_or_else(|_| u.ends_with(".gz")),
        }
    }
}

/// Failure classes the converter's callers branch on.
#[derive(Debug)]
pub enum ConvertError {
    /// Download/open/decompress failure; fatal, nothing was mutated.
    Source(String),
    /// The watchdog saw no written row for the stall window.
    Stalled { seconds: u64 },
    /// Fewer rows written than the configured floor; the feed is suspect.
    Volume { rows_written: u64, floor: u64 },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::Source(msg) => write!(f, "feed source error: {msg}"),
            ConvertError::Stalled { seconds } => {
                write!(f, "streaming conversion stalled: no row written for {seconds}s")
            }
            ConvertError::Volume { rows_written, floor } => write!(
                f,
                "volume anomaly: {rows_written} rows written, expected at least {floor}"
            ),
        }
    }
}

impl std::error::Error for ConvertError {}

#[derive(Debug, Clone, Copy)]
pub struct ConvertSettings {
    pub price_day: NaiveDate,
    pub filter: RecordFilter,
    pub parse_mode: ParseMode,
    pub stall_secs: u64,
    pub min_rows: u64,
}

impl ConvertSettings {
    pub fn from_config(cfg: &PipelineConfig, price_day: NaiveDate) -> Self {
        Self {
            price_day,
            filter: RecordFilter {
                paper_only: cfg.paper_only,
                require_any_price: cfg.require_any_price,
            },
            parse_mode: cfg.parse_mode,
            stall_secs: cfg.stall_secs,
            min_rows: cfg.min_rows,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    rows_in_source: u64,
    rows_written: u64,
    rows_filtered: u64,
}

#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub rows_in_source: u64,
    pub rows_written: u64,
    pub rows_filtered: u64,
    /// Which path produced the CSV: "stream" or "buffer".
    pub parse_mode: &'static str,
    pub fallback_triggered: bool,
}

pub async fn convert_feed(
    settings: &ConvertSettings,
    source: &FeedSource,
    out_path: &Path,
) -> Result<ConvertOutcome> {
    let started = Instant::now();
    let outcome = match settings.parse_mode {
        ParseMode::Buffer => {
            let counts = convert_buffered(settings, source, out_path).await?;
            outcome_from(counts, "buffer", false)
        }
        ParseMode::Stream => {
            let counts = convert_streaming(settings, source, out_path).await?;
            outcome_from(counts, "stream", false)
        }
        ParseMode::Auto => match convert_streaming(settings, source, out_path).await {
            Ok(counts) => outcome_from(counts, "stream", false),
            Err(e) if e.downcast_ref::<ConvertError>().is_some_and(|c| matches!(c, ConvertError::Stalled { .. })) => {
                warn!(error = %e, source = %source.describe(), "streaming parse stalled; discarding partial output and re-reading source in buffer mode");
                let _ = std::fs::remove_file(out_path);
                let counts = convert_buffered(settings, source, out_path).await?;
                outcome_from(counts, "buffer", true)
            }
            Err(e) => return Err(e),
        },
    };

    if settings.min_rows > 0 && outcome.rows_written < settings.min_rows {
        return Err(ConvertError::Volume {
            rows_written: outcome.rows_written,
            floor: settings.min_rows,
        }
        .into());
    }

    info!(
        rows_in_source = outcome.rows_in_source,
        rows_written = outcome.rows_written,
        rows_filtered = outcome.rows_filtered,
        parse_mode = outcome.parse_mode,
        fallback = outcome.fallback_triggered,
        elapsed_ms = started.elapsed().as_millis() as u64,
        out = %out_path.display(),
        "feed conversion complete"
    );
    Ok(outcome)
}

fn outcome_from(counts: Counts, parse_mode: &'static str, fallback: bool) -> ConvertOutcome {
    ConvertOutcome {
        rows_in_source: counts.rows_in_source,
        rows_written: counts.rows_written,
        rows_filtered: counts.rows_filtered,
        parse_mode,
        fallback_triggered: fallback,
    }
}

async fn open_reader(source: &FeedSource) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    let gz = source.is_gzip();
    match source {
        FeedSource::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| ConvertError::Source(format!("open {}: {e}", path.display())))?;
            let buffered = tokio::io::BufReader::new(file);
            Ok(if gz {
                Box::new(GzipDecoder::new(buffered))
            } else {
                Box::new(buffered)
            })
        }
        FeedSource::Url(url) => {
            let client = crate::feed::http_client()?;
            let resp = client
                .get(url)
                .send()
                .await
                .map_err(|e| ConvertError::Source(format!("download {url}: {e}")))?
                .error_for_status()
                .map_err(|e| ConvertError::Source(format!("download {url}: {e}")))?;
            let stream = resp
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                .boxed();
            let reader = StreamReader::new(stream);
            Ok(if gz {
                Box::new(GzipDecoder::new(reader))
            } else {
                Box::new(reader)
            })
        }
    }
}

fn csv_writer(out_path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    let file = File::create(out_path)
        .with_context(|| format!("create staging csv {}", out_path.display()))?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    wtr.write_record(CSV_HEADER)?;
    Ok(wtr)
}

fn transform_record<W: std::io::Write>(
    obj: &[u8],
    settings: &ConvertSettings,
    wtr: &mut csv::Writer<W>,
    counts: &mut Counts,
) -> Result<bool> {
    counts.rows_in_source += 1;
    match serde_json::from_slice::<CardRecord>(obj) {
        Ok(rec) => match record::to_csv_row(&rec, settings.filter, settings.price_day) {
            Some(row) => {
                wtr.write_record(&row)?;
                counts.rows_written += 1;
                Ok(true)
            }
            None => {
                counts.rows_filtered += 1;
                Ok(false)
            }
        },
        Err(e) => {
            warn!(error = %e, "skipping malformed record");
            counts.rows_filtered += 1;
            Ok(false)
        }
    }
}

async fn convert_streaming(
    settings: &ConvertSettings,
    source: &FeedSource,
    out_path: &Path,
) -> Result<Counts> {
    let mut reader = open_reader(source).await?;
    let mut wtr = csv_writer(out_path)?;
    let mut scanner = ObjectScanner::new();
    let mut counts = Counts::default();

    let stall = Duration::from_secs(settings.stall_secs.max(1));
    let mut last_row = Instant::now();
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = match tokio::time::timeout(stall, reader.read(&mut chunk)).await {
            Ok(read) => {
                read.map_err(|e| ConvertError::Source(format!("read feed stream: {e}")))?
            }
            Err(_) => {
                return Err(ConvertError::Stalled {
                    seconds: settings.stall_secs,
                }
                .into())
            }
        };
        if n == 0 {
            break;
        }
        for obj in scanner.feed(&chunk[..n]) {
            if transform_record(&obj, settings, &mut wtr, &mut counts)? {
                last_row = Instant::now();
            }
        }
        // Chunks may keep arriving while the scanner never completes a row
        // (malformed or oddly-chunked input); that counts as a stall too.
        if last_row.elapsed() >= stall {
            return Err(ConvertError::Stalled {
                seconds: settings.stall_secs,
            }
            .into());
        }
        if scanner.is_complete() {
            break;
        }
    }

    scanner.finish()?;
    wtr.flush()?;
    Ok(counts)
}

async fn convert_buffered(
    settings: &ConvertSettings,
    source: &FeedSource,
    out_path: &Path,
) -> Result<Counts> {
    let mut reader = open_reader(source).await?;
    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .await
        .map_err(|e| ConvertError::Source(format!("read feed into memory: {e}")))?;
    info!(bytes = raw.len(), "buffered full feed for one-shot parse");

    let records: Vec<CardRecord> = simd_json::serde::from_slice(&mut raw)
        .map_err(|e| ConvertError::Source(format!("parse buffered feed: {e}")))?;

    let mut wtr = csv_writer(out_path)?;
    let mut counts = Counts::default();
    for rec in &records {
        counts.rows_in_source += 1;
        match record::to_csv_row(rec, settings.filter, settings.price_day) {
            Some(row) => {
                wtr.write_record(&row)?;
                counts.rows_written += 1;
            }
            None => counts.rows_filtered += 1,
        }
    }
    wtr.flush()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FEED: &str = r#"[
        {"id":"11111111-1111-4111-8111-111111111111","name":"One Price",
         "games":["paper"],"prices":{"usd":"0.25","usd_foil":null,"usd_etched":null}},
        {"id":"22222222-2222-4222-8222-222222222222","name":"All Prices",
         "games":["paper","mtgo"],"prices":{"usd":"1.10","usd_foil":"3.99","usd_etched":"12.00"}},
        {"id":"33333333-3333-4333-8333-333333333333","name":"No Prices",
         "games":["paper"],"prices":{"usd":null,"usd_foil":null,"usd_etched":null}}
    ]"#;

    fn settings(parse_mode: ParseMode, require_any_price: bool) -> ConvertSettings {
        ConvertSettings {
            price_day: NaiveDate::from_ymd_opt(2026, 8, 6).unwrap(),
            filter: RecordFilter {
                paper_only: true,
                require_any_price,
            },
            parse_mode,
            stall_secs: 5,
            min_rows: 0,
        }
    }

    fn write_feed(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("feed.json");
        let mut f = File::create(&path).unwrap();
        f.write_all(FEED.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn inclusion_rule_controls_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(&dir);
        let out = dir.path().join("out.csv");

        let strict = convert_feed(
            &settings(ParseMode::Stream, true),
            &FeedSource::File(feed.clone()),
            &out,
        )
        .await
        .unwrap();
        assert_eq!(strict.rows_in_source, 3);
        assert_eq!(strict.rows_written, 2);
        assert_eq!(strict.rows_filtered, 1);

        let lax = convert_feed(
            &settings(ParseMode::Stream, false),
            &FeedSource::File(feed),
            &out,
        )
        .await
        .unwrap();
        assert_eq!(lax.rows_written, 3);
    }

    #[tokio::test]
    async fn stream_and_buffer_output_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(&dir);
        let out_stream = dir.path().join("stream.csv");
        let out_buffer = dir.path().join("buffer.csv");

        let s = convert_feed(
            &settings(ParseMode::Stream, true),
            &FeedSource::File(feed.clone()),
            &out_stream,
        )
        .await
        .unwrap();
        let b = convert_feed(
            &settings(ParseMode::Buffer, true),
            &FeedSource::File(feed),
            &out_buffer,
        )
        .await
        .unwrap();

        assert_eq!(s.parse_mode, "stream");
        assert_eq!(b.parse_mode, "buffer");
        assert_eq!(s.rows_written, b.rows_written);
        assert_eq!(
            std::fs::read(out_stream).unwrap(),
            std::fs::read(out_buffer).unwrap()
        );
    }

    #[tokio::test]
    async fn csv_content_matches_transform() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(&dir);
        let out = dir.path().join("out.csv");
        convert_feed(&settings(ParseMode::Stream, true), &FeedSource::File(feed), &out)
            .await
            .unwrap();
        let text = std::fs::read_to_string(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("id,price_a,price_b,price_c,price_day"));
        assert_eq!(
            lines.next(),
            Some("11111111-1111-4111-8111-111111111111,0.25,,,2026-08-06")
        );
        assert_eq!(
            lines.next(),
            Some("22222222-2222-4222-8222-222222222222,1.10,3.99,12.00,2026-08-06")
        );
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"[{"id":"not-a-uuid","games":["paper"],"prices":{"usd":"1.00"}},
               {"id":"11111111-1111-4111-8111-111111111111","games":["paper"],"prices":{"usd":"2.00"}}]"#,
        )
        .unwrap();
        let out = dir.path().join("out.csv");
        let outcome = convert_feed(
            &settings(ParseMode::Stream, true),
            &FeedSource::File(path),
            &out,
        )
        .await
        .unwrap();
        assert_eq!(outcome.rows_in_source, 2);
        assert_eq!(outcome.rows_written, 1);
    }

    #[tokio::test]
    async fn volume_floor_rejects_thin_feed() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(&dir);
        let out = dir.path().join("out.csv");
        let mut s = settings(ParseMode::Stream, true);
        s.min_rows = 10;
        let err = convert_feed(&s, &FeedSource::File(feed), &out)
            .await
            .unwrap_err();
        let convert_err = err.downcast_ref::<ConvertError>().unwrap();
        assert!(matches!(convert_err, ConvertError::Volume { rows_written: 2, floor: 10 }));
    }

    #[tokio::test]
    async fn truncated_feed_is_an_error_in_stream_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"[{"id":"11111111-1111-4111-8111-111111111111","games":["paper"],"prices":{"usd":"2.00"}},"#,
        )
        .unwrap();
        let out = dir.path().join("out.csv");
        let err = convert_feed(
            &settings(ParseMode::Stream, true),
            &FeedSource::File(path),
            &out,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("before the feed array was closed"));
    }

    #[test]
    fn gz_sources_are_detected() {
        assert!(FeedSource::File(PathBuf::from("/tmp/feed.json.gz")).is_gzip());
        assert!(!FeedSource::File(PathBuf::from("/tmp/feed.json")).is_gzip());
        assert!(FeedSource::Url("https://x/feed.json.gz?tok=1".into()).is_gzip());
        assert!(!FeedSource::Url("https://x/feed.json".into()).is_gzip());
    }
}
