//! Per-record transform shared by the streaming scanner and the buffered
//! fallback: both paths deserialize into [`CardRecord`] and go through
//! [`to_csv_row`], so their CSV output is identical for identical input.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

pub const CSV_HEADER: [&str; 5] = ["id", "price_a", "price_b", "price_c", "price_day"];

/// The classification value that marks a printing the storefront stocks.
pub const PAPER: &str = "paper";

#[derive(Debug, Deserialize)]
pub struct CardRecord {
    pub id: Uuid,
    /// Where this printing is sold ("paper", "mtgo", "arena", ...).
    #[serde(default)]
    pub games: Vec<String>,
    #[serde(default)]
    pub prices: CardPrices,
}

/// The feed carries prices as decimal strings (or null) per finish.
#[derive(Debug, Default, Deserialize)]
pub struct CardPrices {
    #[serde(default)]
    pub usd: Option<String>,
    #[serde(default)]
    pub usd_foil: Option<String>,
    #[serde(default)]
    pub usd_etched: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordFilter {
    pub paper_only: bool,
    pub require_any_price: bool,
}

/// Decimal parse policy: absent/empty is NULL; a non-numeric value is logged
/// and treated as NULL. Never panics, never aborts the run.
fn parse_price_field(card: &Uuid, field: &'static str, raw: Option<&String>) -> Option<BigDecimal> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<BigDecimal>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(card = %card, field, raw, error = %e, "unparseable price; treating as null");
            None
        }
    }
}

/// Apply the inclusion filter and produce one CSV row, or None when the
/// record is filtered out.
pub fn to_csv_row(
    rec: &CardRecord,
    filter: RecordFilter,
    price_day: NaiveDate,
) -> Option<[String; 5]> {
    if filter.paper_only && !rec.games.iter().any(|g| g == PAPER) {
        return None;
    }
    let a = parse_price_field(&rec.id, "usd", rec.prices.usd.as_ref());
    let b = parse_price_field(&rec.id, "usd_foil", rec.prices.usd_foil.as_ref());
    let c = parse_price_field(&rec.id, "usd_etched", rec.prices.usd_etched.as_ref());
    if filter.require_any_price && a.is_none() && b.is_none() && c.is_none() {
        return None;
    }
    let fmt = |v: Option<BigDecimal>| v.map(|d| d.to_string()).unwrap_or_default();
    Some([
        rec.id.to_string(),
        fmt(a),
        fmt(b),
        fmt(c),
        price_day.format("%Y-%m-%d").to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: RecordFilter = RecordFilter {
        paper_only: true,
        require_any_price: true,
    };

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 6).unwrap()
    }

    fn card(games: &[&str], usd: Option<&str>, foil: Option<&str>, etched: Option<&str>) -> CardRecord {
        CardRecord {
            id: Uuid::parse_str("6f2dd1d8-72f1-4f56-9077-85e0e4e178d8").unwrap(),
            games: games.iter().map(|s| s.to_string()).collect(),
            prices: CardPrices {
                usd: usd.map(String::from),
                usd_foil: foil.map(String::from),
                usd_etched: etched.map(String::from),
            },
        }
    }

    #[test]
    fn deserializes_with_unknown_fields() {
        let raw = r#"{
            "id": "6f2dd1d8-72f1-4f56-9077-85e0e4e178d8",
            "name": "Some Card",
            "set": "abc",
            "games": ["paper", "mtgo"],
            "prices": {"usd": "0.25", "usd_foil": null, "eur": "0.20"}
        }"#;
        let rec: CardRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.prices.usd.as_deref(), Some("0.25"));
        assert!(rec.prices.usd_foil.is_none());
    }

    #[test]
    fn digital_only_printings_are_filtered() {
        let rec = card(&["mtgo", "arena"], Some("1.00"), None, None);
        assert!(to_csv_row(&rec, ALL, day()).is_none());
    }

    #[test]
    fn priceless_records_are_filtered_when_required() {
        let rec = card(&["paper"], None, None, None);
        assert!(to_csv_row(&rec, ALL, day()).is_none());
        let lax = RecordFilter {
            paper_only: true,
            require_any_price: false,
        };
        assert!(to_csv_row(&rec, lax, day()).is_some());
    }

    #[test]
    fn one_price_is_enough() {
        let rec = card(&["paper"], Some("0.25"), None, None);
        let row = to_csv_row(&rec, ALL, day()).unwrap();
        assert_eq!(row[1], "0.25");
        assert_eq!(row[2], "");
        assert_eq!(row[3], "");
        assert_eq!(row[4], "2026-08-06");
    }

    #[test]
    fn junk_price_becomes_null_not_error() {
        let rec = card(&["paper"], Some("N/A"), Some("3.50"), None);
        let row = to_csv_row(&rec, ALL, day()).unwrap();
        assert_eq!(row[1], "");
        assert_eq!(row[2], "3.50");
    }

    #[test]
    fn decimal_scale_is_preserved() {
        let rec = card(&["paper"], Some("1.10"), None, None);
        let row = to_csv_row(&rec, ALL, day()).unwrap();
        assert_eq!(row[1], "1.10");
    }
}
