//! Historical FX rate fetcher.
//!
//! The API serves one JSON document per date with a `rates` map and the
//! date the quotes actually belong to, which covers weekend requests.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

use super::FxPoint;
use crate::money::{round_rate, Currency};

#[derive(Debug, Deserialize)]
struct FxResponse {
    date: Option<NaiveDate>,
    rates: Option<HashMap<String, f64>>,
}

/// Rate converting one unit of `from` into `to` on `date`.
pub async fn fetch_rate(
    client: &reqwest::Client,
    base_url: &str,
    from: Currency,
    to: Currency,
    date: NaiveDate,
) -> Result<Option<FxPoint>> {
    let url = format!(
        "{}/{}?base={}&symbols={}",
        base_url,
        date.format("%Y-%m-%d"),
        from.as_str(),
        to.as_str()
    );
    log::debug!("Fetching FX {}/{} from {}", from, to, url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| anyhow!("Request failed for {}/{}: {}", from, to, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP error for {}/{}: {}", from, to, status));
    }

    let data: FxResponse = response
        .json()
        .await
        .map_err(|e| anyhow!("Failed to parse JSON for {}/{}: {}", from, to, e))?;

    let rate = data
        .rates
        .as_ref()
        .and_then(|rates| rates.get(to.as_str()))
        .copied()
        .and_then(Decimal::from_f64)
        .map(round_rate);

    let rate = match rate {
        Some(r) if r > Decimal::ZERO => r,
        // The source has no quote for this pair.
        _ => return Ok(None),
    };

    Ok(Some(FxPoint {
        rate,
        // The API reports which day the quote belongs to; weekends come
        // back stamped with the preceding business day.
        actual_date: data.date.unwrap_or(date),
    }))
}
