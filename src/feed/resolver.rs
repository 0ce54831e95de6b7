//! Feed resolver: find the day's bulk download URL.
//!
//! An explicit FEED_URL wins; otherwise the provider's bulk metadata endpoint
//! is queried and the dataset selected by type.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::PipelineConfig;

#[derive(Debug, Deserialize)]
pub struct BulkDataEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub download_uri: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

// The provider wraps the listing in `{"data": [...]}`; accept a bare array
// too so fixtures and mirrors keep working.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing {
    Wrapped { data: Vec<BulkDataEntry> },
    Bare(Vec<BulkDataEntry>),
}

impl Listing {
    fn into_entries(self) -> Vec<BulkDataEntry> {
        match self {
            Listing::Wrapped { data } => data,
            Listing::Bare(entries) => entries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedFeed {
    pub url: String,
    pub size: Option<u64>,
    pub updated_at: Option<String>,
}

pub async fn resolve_feed(cfg: &PipelineConfig) -> Result<ResolvedFeed> {
    if let Some(url) = &cfg.feed_url {
        info!(url, "using configured feed url");
        return Ok(ResolvedFeed {
            url: url.clone(),
            size: None,
            updated_at: None,
        });
    }

    let client = crate::feed::http_client()?;
    let listing: Listing = client
        .get(&cfg.feed_meta_url)
        .send()
        .await
        .with_context(|| format!("fetch bulk metadata from {}", cfg.feed_meta_url))?
        .error_for_status()
        .context("bulk metadata endpoint returned an error status")?
        .json()
        .await
        .context("decode bulk metadata listing")?;

    let entry = listing
        .into_entries()
        .into_iter()
        .find(|e| e.kind == cfg.feed_dataset)
        .ok_or_else(|| {
            anyhow!(
                "dataset '{}' not present in bulk metadata listing",
                cfg.feed_dataset
            )
        })?;

    info!(
        url = %entry.download_uri,
        size = ?entry.size,
        updated_at = ?entry.updated_at,
        "resolved bulk dataset"
    );
    Ok(ResolvedFeed {
        url: entry.download_uri,
        size: entry.size,
        updated_at: entry.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wrapped_listing() {
        let raw = r#"{"object":"list","data":[
            {"type":"oracle_cards","download_uri":"https://x/oracle.json"},
            {"type":"default_cards","download_uri":"https://x/default.json",
             "updated_at":"2026-08-06T09:01:00Z","size":429000000}
        ]}"#;
        let listing: Listing = serde_json::from_str(raw).unwrap();
        let entries = listing.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, "default_cards");
        assert_eq!(entries[1].size, Some(429_000_000));
    }

    #[test]
    fn decodes_bare_listing() {
        let raw = r#"[{"type":"default_cards","download_uri":"https://x/d.json"}]"#;
        let listing: Listing = serde_json::from_str(raw).unwrap();
        assert_eq!(listing.into_entries()[0].download_uri, "https://x/d.json");
    }
}
