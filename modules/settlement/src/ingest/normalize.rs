//! Settlement flat file -> typed rows
//!
//! Column names are lower-cased and trimmed, the spaced variants of the
//! amount columns are folded into their hyphenated names, and `amount` is
//! taken from `amount` or `total-amount`. Parsing never fails on a bad cell:
//! unparseable amounts become zero and are logged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::models::{ReportHeader, SettlementRow};

const AMOUNT_TYPE: &str = "amount-type";
const AMOUNT_DESCRIPTION: &str = "amount-description";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),
}

/// Tab when the header line contains one, comma otherwise
pub fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.contains('\t') {
        b'\t'
    } else {
        b','
    }
}

/// Map a raw header to its canonical name
pub fn canonical_column(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "amount type" => AMOUNT_TYPE.to_string(),
        "amount description" => AMOUNT_DESCRIPTION.to_string(),
        _ => lower,
    }
}

/// Parse a report amount; thousands separators accepted, zero on failure
pub fn parse_amount(raw: &str) -> Decimal {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .unwrap_or_else(|_| {
            tracing::debug!(value = %raw, "Unparseable amount, defaulting to zero");
            Decimal::ZERO
        })
}

/// Parse decoded report text into rows
pub fn parse_report_text(text: &str) -> Result<Vec<SettlementRow>, NormalizeError> {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let raw_headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let headers = canonical_headers(&raw_headers);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut cells: BTreeMap<String, String> = BTreeMap::new();
        for (idx, value) in record.iter().enumerate() {
            let Some(Some(name)) = headers.get(idx) else {
                continue;
            };
            cells.insert(name.clone(), value.to_string());
        }
        rows.push(row_from_cells(cells));
    }

    Ok(rows)
}

/// Canonical header per column; `None` for a spaced duplicate whose hyphenated
/// form is also present
fn canonical_headers(raw: &[String]) -> Vec<Option<String>> {
    let hyphenated: Vec<String> = raw.iter().map(|h| h.trim().to_lowercase()).collect();
    raw.iter()
        .map(|h| {
            let lower = h.trim().to_lowercase();
            let canonical = canonical_column(&lower);
            if canonical != lower && hyphenated.iter().any(|other| *other == canonical) {
                None
            } else {
                Some(canonical)
            }
        })
        .collect()
}

fn row_from_cells(mut cells: BTreeMap<String, String>) -> SettlementRow {
    let mut take = |name: &str| -> Option<String> {
        cells
            .remove(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let transaction_type = take("transaction-type").unwrap_or_default().to_lowercase();
    let order_id = take("order-id");
    let merchant_order_id = take("merchant-order-id");
    let marketplace_name = take("marketplace-name").map(|m| m.to_lowercase());
    let sku = take("sku");
    let amount_type = take(AMOUNT_TYPE).unwrap_or_default();
    let amount_description = take(AMOUNT_DESCRIPTION).unwrap_or_default();
    let amount_raw = take("amount");
    let total_raw = take("total-amount");
    let currency = take("currency").map(|c| c.to_uppercase());

    let amount = amount_raw
        .or(total_raw)
        .map(|raw| parse_amount(&raw))
        .unwrap_or(Decimal::ZERO);

    let extra = cells;

    SettlementRow {
        transaction_type,
        order_id,
        merchant_order_id,
        marketplace_name,
        sku,
        amount_type,
        amount_description,
        amount,
        currency,
        extra,
    }
}

/// Parse `YYYY-MM-DD[ HH:MM:SS][ UTC]`, RFC 3339, or `DD.MM.YYYY[ HH:MM:SS][ UTC]`
pub fn parse_report_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }

    let cleaned = trimmed
        .strip_suffix("UTC")
        .or_else(|| trimmed.strip_suffix("utc"))
        .unwrap_or(trimmed)
        .trim();

    const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%d.%m.%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(dt);
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(cleaned, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn date_part(raw: &str) -> Option<String> {
    raw.split_whitespace().next().map(|s| s.to_string())
}

/// Settlement period and deposit date from the first row
pub fn extract_header(rows: &[SettlementRow]) -> ReportHeader {
    let Some(first) = rows.first() else {
        return ReportHeader::default();
    };

    let start_raw = first.extra_value("settlement-start-date");
    let end_raw = first.extra_value("settlement-end-date");
    let deposit_raw = first.extra_value("deposit-date");

    let deposit_at = deposit_raw.and_then(|raw| match parse_report_datetime(raw) {
        Some(dt) => Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)),
        None => {
            tracing::warn!(value = %raw, category = "data_quality", "Unparseable deposit date");
            None
        }
    });

    ReportHeader {
        start_text: start_raw.and_then(date_part),
        end_text: end_raw.and_then(date_part),
        settlement_start: start_raw.and_then(parse_report_datetime).map(|d| d.date()),
        settlement_end: end_raw.and_then(parse_report_datetime).map(|d| d.date()),
        deposit_at,
    }
}
