//! Yahoo Finance chart API fetcher for non-TW markets.

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::StockMarket;
use crate::money::round_rate;

const BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Exchange suffix Yahoo expects for the market.
pub fn symbol_for(ticker: &str, market: StockMarket) -> String {
    match market {
        StockMarket::Us => ticker.to_string(),
        StockMarket::Uk => format!("{}.L", ticker),
        StockMarket::Eu => format!("{}.DE", ticker),
        // TW quotes go through TWSE, never here.
        StockMarket::Tw => format!("{}.TW", ticker),
    }
}

/// Closing price on the nearest trading day at or before `date`.
///
/// Fetches a ten-day window ending at the requested date so weekends and
/// holidays resolve to the preceding session.
pub async fn fetch_close_near(
    client: &reqwest::Client,
    ticker: &str,
    market: StockMarket,
    date: NaiveDate,
) -> Result<Option<(NaiveDate, Decimal)>> {
    let symbol = symbol_for(ticker, market);
    let from = date - Duration::days(10);

    let from_ts = from
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0);
    let to_ts = date
        .and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0);

    let url = format!(
        "{}/{}?period1={}&period2={}&interval=1d",
        BASE_URL,
        urlencoding::encode(&symbol),
        from_ts,
        to_ts
    );
    log::debug!("Fetching Yahoo window for {} from {}", symbol, url);

    let response = client
        .get(&url)
        .header(
            reqwest::header::USER_AGENT,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        )
        .send()
        .await
        .map_err(|e| anyhow!("Request failed for {}: {}", symbol, e))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(anyhow!("HTTP error for {}: {}", symbol, status));
    }

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| anyhow!("Failed to parse JSON for {}: {}", symbol, e))?;

    if let Some(error) = data
        .get("chart")
        .and_then(|c| c.get("error"))
        .and_then(|e| e.as_object())
    {
        let code = error.get("code").and_then(|c| c.as_str()).unwrap_or("");
        // "Not Found" means the symbol does not exist on this exchange.
        if code.eq_ignore_ascii_case("not found") {
            return Ok(None);
        }
        let desc = error
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("no description");
        return Err(anyhow!("Yahoo API error for {}: {} - {}", symbol, code, desc));
    }

    Ok(pick_close_near(&data, date))
}

/// Walk the chart arrays and keep the last close dated at or before `date`.
fn pick_close_near(data: &serde_json::Value, date: NaiveDate) -> Option<(NaiveDate, Decimal)> {
    let chart = data
        .get("chart")
        .and_then(|c| c.get("result"))
        .and_then(|r| r.get(0))?;

    let timestamps = chart.get("timestamp").and_then(|t| t.as_array())?;
    let closes = chart
        .get("indicators")
        .and_then(|i| i.get("quote"))
        .and_then(|q| q.get(0))
        .and_then(|q| q.get("close"))
        .and_then(|c| c.as_array())?;

    let mut best: Option<(NaiveDate, Decimal)> = None;
    for (i, ts) in timestamps.iter().enumerate() {
        let bar_date = ts
            .as_i64()
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
            .map(|dt| dt.date_naive());
        let close = closes
            .get(i)
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64)
            .map(round_rate);

        if let (Some(bar_date), Some(close)) = (bar_date, close) {
            if bar_date <= date && best.map_or(true, |(d, _)| bar_date > d) {
                best = Some((bar_date, close));
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_symbol_suffixes() {
        assert_eq!(symbol_for("AAPL", StockMarket::Us), "AAPL");
        assert_eq!(symbol_for("VOD", StockMarket::Uk), "VOD.L");
        assert_eq!(symbol_for("SAP", StockMarket::Eu), "SAP.DE");
    }

    #[test]
    fn test_pick_close_skips_null_bars_and_later_days() {
        // 2024-01-04, 2024-01-05, 2024-01-08 as UTC midnights.
        let data = json!({
            "chart": { "result": [{
                "timestamp": [1704326400i64, 1704412800i64, 1704672000i64],
                "indicators": { "quote": [{
                    "close": [181.91, serde_json::Value::Null, 185.56]
                }]}
            }]}
        });

        // Requesting the 7th (Sunday): the null 5th is skipped, the 8th is
        // in the future, so the 4th wins.
        let (day, close) =
            pick_close_near(&data, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()).unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert_eq!(close, dec!(181.91));
    }

    #[test]
    fn test_pick_close_empty_result() {
        let data = json!({ "chart": { "result": [{ "timestamp": [] }] } });
        assert!(pick_close_near(&data, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()).is_none());
    }
}
