pub mod convert;
pub mod record;
pub mod resolver;
pub mod scan;

use std::time::Duration;

use anyhow::{Context, Result};

/// Shared HTTP client for the feed endpoints. No overall request timeout:
/// bulk downloads stream for minutes; the converter's watchdog owns liveness.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("cardcompare/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}
