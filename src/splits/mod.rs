//! Stock split events and historical share adjustment.
//!
//! Splits are globally shared per `(symbol, market)`. A transaction dated
//! before a split is projected to post-split share counts at read time by
//! multiplying its shares with every later split ratio. Cost basis is
//! never adjusted.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::db;
use crate::error::{AppError, Result};
use crate::models::{StockMarket, StockSplit};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStockSplit {
    pub symbol: String,
    pub market: StockMarket,
    pub split_date: NaiveDate,
    pub ratio: Decimal,
    pub description: Option<String>,
}

pub fn create_split(conn: &Connection, split: &NewStockSplit) -> Result<StockSplit> {
    if split.ratio <= Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "split ratio must be positive, got {}",
            split.ratio
        )));
    }
    let symbol = split.symbol.trim().to_uppercase();

    conn.execute(
        r#"INSERT INTO stock_split (symbol, market, split_date, ratio, description)
           VALUES (?1, ?2, ?3, ?4, ?5)"#,
        params![
            symbol,
            split.market.as_str(),
            split.split_date,
            split.ratio.to_string(),
            split.description,
        ],
    )?;
    let id = conn.last_insert_rowid();

    log::info!(
        "Recorded split {} {} {} ratio {}",
        symbol,
        split.market.as_str(),
        split.split_date,
        split.ratio
    );

    Ok(StockSplit {
        id,
        symbol,
        market: split.market,
        split_date: split.split_date,
        ratio: split.ratio,
        description: split.description.clone(),
    })
}

pub fn delete_split(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn.execute("DELETE FROM stock_split WHERE id = ?1", [id])?;
    if deleted == 0 {
        return Err(AppError::EntityNotFound(format!("stock split {}", id)));
    }
    Ok(())
}

/// All splits for a symbol on one market, oldest first.
pub fn splits_for(conn: &Connection, symbol: &str, market: StockMarket) -> Result<Vec<StockSplit>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, symbol, market, split_date, ratio, description
           FROM stock_split
           WHERE symbol = ?1 AND market = ?2
           ORDER BY split_date"#,
    )?;

    let splits = stmt
        .query_map(params![symbol, market.as_str()], |row| {
            Ok(StockSplit {
                id: row.get(0)?,
                symbol: row.get(1)?,
                market: db::enum_col(row, 2, StockMarket::parse)?,
                split_date: row.get(3)?,
                ratio: db::dec_col(row, 4)?,
                description: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(splits)
}

/// Every split in the table, for batch position recalculation.
pub fn all_splits(conn: &Connection) -> Result<Vec<StockSplit>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, symbol, market, split_date, ratio, description
           FROM stock_split ORDER BY symbol, market, split_date"#,
    )?;

    let splits = stmt
        .query_map([], |row| {
            Ok(StockSplit {
                id: row.get(0)?,
                symbol: row.get(1)?,
                market: db::enum_col(row, 2, StockMarket::parse)?,
                split_date: row.get(3)?,
                ratio: db::dec_col(row, 4)?,
                description: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(splits)
}

/// Shares of a transaction dated `txn_date`, projected through every split
/// that happened after it.
pub fn adjusted_shares(
    shares: Decimal,
    txn_date: NaiveDate,
    symbol: &str,
    market: StockMarket,
    splits: &[StockSplit],
) -> Decimal {
    let mut adjusted = shares;
    for split in splits {
        if split.symbol == symbol && split.market == market && split.split_date > txn_date {
            adjusted *= split.ratio;
        }
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn split(symbol: &str, market: StockMarket, d: NaiveDate, ratio: Decimal) -> StockSplit {
        StockSplit {
            id: 0,
            symbol: symbol.into(),
            market,
            split_date: d,
            ratio,
            description: None,
        }
    }

    #[test]
    fn test_splits_after_txn_inflate_shares() {
        let splits = vec![
            split("AAPL", StockMarket::Us, date(2020, 8, 31), dec!(4)),
            split("AAPL", StockMarket::Us, date(2014, 6, 9), dec!(7)),
        ];

        // Bought before both splits: 7 * 4.
        assert_eq!(
            adjusted_shares(dec!(10), date(2013, 1, 2), "AAPL", StockMarket::Us, &splits),
            dec!(280)
        );
        // Bought between the splits: only the 2020 split applies.
        assert_eq!(
            adjusted_shares(dec!(10), date(2018, 1, 2), "AAPL", StockMarket::Us, &splits),
            dec!(40)
        );
        // Bought after both: untouched.
        assert_eq!(
            adjusted_shares(dec!(10), date(2021, 1, 2), "AAPL", StockMarket::Us, &splits),
            dec!(10)
        );
    }

    #[test]
    fn test_split_on_txn_date_does_not_apply() {
        let splits = vec![split("AAPL", StockMarket::Us, date(2020, 8, 31), dec!(4))];
        assert_eq!(
            adjusted_shares(dec!(10), date(2020, 8, 31), "AAPL", StockMarket::Us, &splits),
            dec!(10)
        );
    }

    #[test]
    fn test_other_symbol_and_market_ignored() {
        let splits = vec![
            split("AAPL", StockMarket::Us, date(2020, 8, 31), dec!(4)),
            split("2330", StockMarket::Tw, date(2020, 8, 31), dec!(2)),
        ];
        // Same ticker on another market is a different position.
        assert_eq!(
            adjusted_shares(dec!(10), date(2019, 1, 2), "AAPL", StockMarket::Eu, &splits),
            dec!(10)
        );
    }

    #[test]
    fn test_create_and_query_roundtrip() {
        let conn = db::init_in_memory().unwrap();
        create_split(
            &conn,
            &NewStockSplit {
                symbol: "aapl".into(),
                market: StockMarket::Us,
                split_date: date(2020, 8, 31),
                ratio: dec!(4),
                description: Some("4-for-1".into()),
            },
        )
        .unwrap();

        let found = splits_for(&conn, "AAPL", StockMarket::Us).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ratio, dec!(4));
        // Symbol was normalized on insert.
        assert_eq!(found[0].symbol, "AAPL");
    }

    #[test]
    fn test_nonpositive_ratio_rejected() {
        let conn = db::init_in_memory().unwrap();
        let result = create_split(
            &conn,
            &NewStockSplit {
                symbol: "AAPL".into(),
                market: StockMarket::Us,
                split_date: date(2020, 8, 31),
                ratio: dec!(0),
                description: None,
            },
        );
        assert!(matches!(result, Err(AppError::BusinessRule(_))));
    }
}
