//! Pipeline configuration collected once from the environment and passed
//! into each stage entry point. Stages never read env vars directly.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;

use crate::util::env::{env_flag, env_opt, env_parse, env_parse_opt};

/// Which converter path to run. `Auto` streams and falls back to `Buffer`
/// when the watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Auto,
    Stream,
    Buffer,
}

impl FromStr for ParseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ParseMode::Auto),
            "stream" => Ok(ParseMode::Stream),
            "buffer" => Ok(ParseMode::Buffer),
            other => Err(anyhow::anyhow!("unknown parse mode '{other}'")),
        }
    }
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Auto => "auto",
            ParseMode::Stream => "stream",
            ParseMode::Buffer => "buffer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub db_max_connections: u32,

    /// Explicit bulk download URL; overrides metadata discovery when set.
    pub feed_url: Option<String>,
    /// Bulk metadata endpoint listing the provider's daily datasets.
    pub feed_meta_url: String,
    /// Dataset selector within the metadata listing.
    pub feed_dataset: String,
    /// Stamp written into history rows' `source` column.
    pub feed_source: String,

    /// Keep only records sold in paper (the feed also carries digital-only
    /// printings the storefront does not stock).
    pub paper_only: bool,
    /// Drop records carrying no price in any finish.
    pub require_any_price: bool,

    pub parse_mode: ParseMode,
    /// Watchdog window: no CSV row written for this long aborts streaming.
    pub stall_secs: u64,
    /// Reject the run when fewer rows than this were written (0 disables).
    pub min_rows: u64,

    pub stage_batch_size: usize,

    pub gate_ratio_min: Option<f64>,
    pub gate_ratio_max: Option<f64>,

    pub retention_days: i64,
    pub retention_batch_rows: i64,
    pub retention_pause_ms: u64,

    /// Where intermediate CSV files land when the caller does not pick a path.
    pub work_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = crate::util::env::db_url()?;
        Ok(Self {
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNS", 8u32),
            feed_url: env_opt("FEED_URL"),
            feed_meta_url: env_opt("FEED_META_URL")
                .unwrap_or_else(|| "https://api.scryfall.com/bulk-data".into()),
            feed_dataset: env_opt("FEED_DATASET").unwrap_or_else(|| "default_cards".into()),
            feed_source: env_opt("FEED_SOURCE").unwrap_or_else(|| "scryfall".into()),
            paper_only: env_flag("FEED_PAPER_ONLY", true),
            require_any_price: env_flag("FEED_REQUIRE_PRICE", true),
            parse_mode: env_opt("FEED_PARSE_MODE")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or(ParseMode::Auto),
            stall_secs: env_parse("FEED_STALL_SECS", 60u64),
            min_rows: env_parse("FEED_MIN_ROWS", 50_000u64),
            stage_batch_size: env_parse("STAGE_BATCH_SIZE", 5_000usize),
            gate_ratio_min: env_parse_opt("GATE_RATIO_MIN"),
            gate_ratio_max: env_parse_opt("GATE_RATIO_MAX"),
            retention_days: env_parse("RETENTION_DAYS", 30i64),
            retention_batch_rows: env_parse("RETENTION_BATCH_ROWS", 200_000i64),
            retention_pause_ms: env_parse("RETENTION_PAUSE_MS", 500u64),
            work_dir: env_opt("FEED_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        })
    }

    /// Acceptance bounds for the consistency gate. With the paper filter off
    /// the feed should closely match the destination population, so the
    /// default window tightens; explicit GATE_RATIO_MIN/MAX always win.
    pub fn gate_bounds(&self) -> (f64, f64) {
        let (lo, hi) = if self.paper_only {
            (0.90, 1.10)
        } else {
            (0.95, 1.05)
        };
        (
            self.gate_ratio_min.unwrap_or(lo),
            self.gate_ratio_max.unwrap_or(hi),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PipelineConfig {
        PipelineConfig {
            database_url: "postgres://localhost/cards".into(),
            db_max_connections: 8,
            feed_url: None,
            feed_meta_url: "https://api.scryfall.com/bulk-data".into(),
            feed_dataset: "default_cards".into(),
            feed_source: "scryfall".into(),
            paper_only: true,
            require_any_price: true,
            parse_mode: ParseMode::Auto,
            stall_secs: 60,
            min_rows: 50_000,
            stage_batch_size: 5_000,
            gate_ratio_min: None,
            gate_ratio_max: None,
            retention_days: 30,
            retention_batch_rows: 200_000,
            retention_pause_ms: 500,
            work_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn gate_bounds_follow_filter_mode() {
        let mut cfg = base_config();
        assert_eq!(cfg.gate_bounds(), (0.90, 1.10));
        cfg.paper_only = false;
        assert_eq!(cfg.gate_bounds(), (0.95, 1.05));
        cfg.gate_ratio_min = Some(0.8);
        cfg.gate_ratio_max = Some(1.2);
        assert_eq!(cfg.gate_bounds(), (0.8, 1.2));
    }

    #[test]
    fn parse_mode_round_trips() {
        assert_eq!("stream".parse::<ParseMode>().unwrap(), ParseMode::Stream);
        assert_eq!("BUFFER".parse::<ParseMode>().unwrap(), ParseMode::Buffer);
        assert!("yolo".parse::<ParseMode>().is_err());
    }
}
