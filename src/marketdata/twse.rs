//! Taiwan Stock Exchange daily quote fetcher.
//!
//! Uses the STOCK_DAY report, which returns one month of daily closes per
//! request. Dates arrive in ROC calendar form ("113/01/05") and numbers
//! carry thousands separators.

use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use crate::money::round_rate;

/// Closing price on the nearest trading day at or before `date`.
///
/// Looks at the requested month first and falls back to the previous month
/// for dates early in a month with no sessions yet.
pub async fn fetch_close_near(
    client: &reqwest::Client,
    base_url: &str,
    stock_no: &str,
    date: NaiveDate,
) -> Result<Option<(NaiveDate, Decimal)>> {
    let mut month_anchor = date;

    for _ in 0..2 {
        let rows = fetch_month(client, base_url, stock_no, month_anchor).await?;
        let best = rows
            .into_iter()
            .filter(|(d, _)| *d <= date)
            .max_by_key(|(d, _)| *d);
        if best.is_some() {
            return Ok(best);
        }

        // Step into the previous month.
        let first = month_anchor.with_day(1).expect("first of month");
        month_anchor = first.pred_opt().ok_or_else(|| anyhow!("date underflow"))?;
    }

    Ok(None)
}

/// One month of `(trading day, close)` rows, oldest first.
async fn fetch_month(
    client: &reqwest::Client,
    base_url: &str,
    stock_no: &str,
    month: NaiveDate,
) -> Result<Vec<(NaiveDate, Decimal)>> {
    let url = format!(
        "{}/exchangeReport/STOCK_DAY?response=json&date={}&stockNo={}",
        base_url,
        month.format("%Y%m01"),
        urlencoding::encode(stock_no)
    );
    log::debug!("Fetching TWSE month for {} from {}", stock_no, url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| anyhow!("Request failed for {}: {}", stock_no, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP error for {}: {}", stock_no, status));
    }

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| anyhow!("Failed to parse JSON for {}: {}", stock_no, e))?;

    let stat = data.get("stat").and_then(|s| s.as_str()).unwrap_or("");
    if stat != "OK" {
        // "很抱歉，沒有符合條件的資料!" means the symbol has no data there.
        log::debug!("TWSE stat for {}: {}", stock_no, stat);
        return Ok(Vec::new());
    }

    let rows = data
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Missing data rows for {}", stock_no))?;

    let mut result = Vec::new();
    for row in rows {
        let cells = match row.as_array() {
            Some(c) if c.len() >= 7 => c,
            _ => continue,
        };
        let date = match cells[0].as_str().and_then(parse_roc_date) {
            Some(d) => d,
            None => continue,
        };
        // Column 6 is the closing price; "--" on no-trade days.
        let close = match cells[6].as_str().and_then(parse_twse_number) {
            Some(c) => c,
            None => continue,
        };
        result.push((date, close));
    }

    Ok(result)
}

/// "113/01/05" (ROC year) → 2024-01-05.
fn parse_roc_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.split('/');
    let year: i32 = parts.next()?.trim().parse().ok()?;
    let month: u32 = parts.next()?.trim().parse().ok()?;
    let day: u32 = parts.next()?.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(year + 1911, month, day)
}

/// "1,234.50" → 1234.50; "--" → None.
fn parse_twse_number(s: &str) -> Option<Decimal> {
    let cleaned = s.trim().replace(',', "");
    if cleaned.is_empty() || cleaned == "--" {
        return None;
    }
    cleaned.parse().ok().map(round_rate)
}
