//! Stooq daily-quote fetcher, the fallback source for non-TW markets.
//!
//! Stooq serves plain CSV: `Date,Open,High,Low,Close,Volume`.

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::StockMarket;
use crate::money::round_rate;

const BASE_URL: &str = "https://stooq.com/q/d/l/";

/// Stooq uses lowercase symbols with a market suffix.
pub fn symbol_for(ticker: &str, market: StockMarket) -> String {
    let ticker = ticker.to_lowercase();
    match market {
        StockMarket::Us => format!("{}.us", ticker),
        StockMarket::Uk => format!("{}.uk", ticker),
        StockMarket::Eu => format!("{}.de", ticker),
        StockMarket::Tw => ticker,
    }
}

#[derive(Debug, Deserialize)]
struct StooqRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Close")]
    close: Decimal,
}

/// Closing price on the nearest trading day at or before `date`.
pub async fn fetch_close_near(
    client: &reqwest::Client,
    ticker: &str,
    market: StockMarket,
    date: NaiveDate,
) -> Result<Option<(NaiveDate, Decimal)>> {
    let symbol = symbol_for(ticker, market);
    let from = date - Duration::days(10);

    let url = format!(
        "{}?s={}&d1={}&d2={}&i=d",
        BASE_URL,
        urlencoding::encode(&symbol),
        from.format("%Y%m%d"),
        date.format("%Y%m%d")
    );
    log::debug!("Fetching Stooq window for {} from {}", symbol, url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| anyhow!("Request failed for {}: {}", symbol, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP error for {}: {}", symbol, status));
    }

    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response for {}: {}", symbol, e))?;

    // An unknown symbol answers with a one-line "No data" body.
    if !body.starts_with("Date,") {
        return Ok(None);
    }

    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let mut best: Option<(NaiveDate, Decimal)> = None;
    for row in reader.deserialize::<StooqRow>() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Skipping malformed Stooq row for {}: {}", symbol, e);
                continue;
            }
        };
        if row.date <= date && best.map_or(true, |(d, _)| row.date > d) {
            best = Some((row.date, round_rate(row.close)));
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_suffixes() {
        assert_eq!(symbol_for("AAPL", StockMarket::Us), "aapl.us");
        assert_eq!(symbol_for("VOD", StockMarket::Uk), "vod.uk");
        assert_eq!(symbol_for("SAP", StockMarket::Eu), "sap.de");
    }

    #[test]
    fn test_csv_parsing_picks_nearest_row() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2024-01-04,181.0,183.1,180.9,181.91,71983600\n\
                    2024-01-05,181.5,182.8,180.2,181.18,62303300\n";

        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let date = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        let mut best: Option<(NaiveDate, Decimal)> = None;
        for row in reader.deserialize::<StooqRow>() {
            let row = row.unwrap();
            if row.date <= date && best.map_or(true, |(d, _)| row.date > d) {
                best = Some((row.date, round_rate(row.close)));
            }
        }

        let (day, close) = best.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(close, dec!(181.18));
    }
}
