//! CSV import and export.
//!
//! Currency-transaction import is atomic: either every row commits or
//! none do, and the report carries one entry per rejected row with enough
//! context for the user to fix the file. Stock-transaction import applies
//! row semantics: each valid row settles through the normal create path.

use chrono::NaiveDate;
use csv::StringRecord;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::{Read, Write};

use crate::error::{AppError, Result};
use crate::ledger::{self, NewCurrencyTransaction};
use crate::marketdata::MarketData;
use crate::models::{
    BalanceAction, CurrencyTransactionType, FundSource, StockMarket, StockTransactionType,
};
use crate::money::Currency;
use crate::snapshots;
use crate::transactions::{self, NewStockTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total_rows: usize,
    pub inserted_rows: usize,
    pub rejected_rows: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row_number: usize,
    pub field_name: String,
    pub invalid_value: String,
    pub error_code: String,
    pub message: String,
    pub correction_guidance: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub status: ImportStatus,
    pub summary: ImportSummary,
    pub errors: Vec<RowError>,
}

// =============================================================================
// Field helpers
// =============================================================================

struct RowReader<'a> {
    headers: &'a StringRecord,
    record: &'a StringRecord,
    row_number: usize,
}

impl RowReader<'_> {
    fn raw(&self, field: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(field))
            .and_then(|idx| self.record.get(idx))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn error(&self, field: &str, code: &str, message: String, guidance: &str) -> RowError {
        RowError {
            row_number: self.row_number,
            field_name: field.to_string(),
            invalid_value: self.raw(field).unwrap_or("").to_string(),
            error_code: code.to_string(),
            message,
            correction_guidance: guidance.to_string(),
        }
    }

    fn required(&self, field: &str) -> std::result::Result<&str, RowError> {
        self.raw(field).ok_or_else(|| {
            self.error(
                field,
                "MissingField",
                format!("column {} is required", field),
                "Provide a non-empty value",
            )
        })
    }

    fn date(&self, field: &str) -> std::result::Result<NaiveDate, RowError> {
        let value = self.required(field)?;
        NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
            self.error(
                field,
                "InvalidDate",
                format!("{:?} is not a date", value),
                "Use the YYYY-MM-DD format",
            )
        })
    }

    fn decimal(&self, field: &str) -> std::result::Result<Decimal, RowError> {
        let value = self.required(field)?;
        value.parse().map_err(|_| {
            self.error(
                field,
                "InvalidNumber",
                format!("{:?} is not a number", value),
                "Use a plain decimal number without separators",
            )
        })
    }

    fn optional_decimal(&self, field: &str) -> std::result::Result<Option<Decimal>, RowError> {
        match self.raw(field) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                self.error(
                    field,
                    "InvalidNumber",
                    format!("{:?} is not a number", value),
                    "Use a plain decimal number without separators",
                )
            }),
        }
    }

    fn parse_enum<T>(
        &self,
        field: &str,
        parse: impl Fn(&str) -> Option<T>,
        expected: &str,
    ) -> std::result::Result<T, RowError> {
        let value = self.required(field)?;
        parse(value).ok_or_else(|| {
            self.error(
                field,
                "InvalidValue",
                format!("{:?} is not a valid {}", value, field),
                expected,
            )
        })
    }
}

fn report(total: usize, inserted: usize, errors: Vec<RowError>) -> ImportReport {
    ImportReport {
        status: if errors.is_empty() {
            ImportStatus::Success
        } else {
            ImportStatus::Failed
        },
        summary: ImportSummary {
            total_rows: total,
            inserted_rows: inserted,
            rejected_rows: total - inserted,
            error_count: errors.len(),
        },
        errors,
    }
}

// =============================================================================
// Currency transactions
// =============================================================================

/// Parse and validate every row, then commit all of them in one database
/// transaction; a single bad row rejects the whole file.
pub fn import_currency_transactions<R: Read>(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    ledger_id: i64,
    reader: R,
) -> Result<ImportReport> {
    ledger::get_ledger_owned(conn, ledger_id, user_id)?;

    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| AppError::BusinessRule(format!("unreadable CSV header: {}", e)))?
        .clone();

    let mut rows: Vec<NewCurrencyTransaction> = Vec::new();
    let mut errors: Vec<RowError> = Vec::new();
    let mut total = 0usize;

    for (index, record) in csv_reader.records().enumerate() {
        total += 1;
        let row_number = index + 2; // header is line 1
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                errors.push(RowError {
                    row_number,
                    field_name: String::new(),
                    invalid_value: String::new(),
                    error_code: "MalformedRow".into(),
                    message: e.to_string(),
                    correction_guidance: "Fix the CSV quoting or column count".into(),
                });
                continue;
            }
        };
        let row = RowReader {
            headers: &headers,
            record: &record,
            row_number,
        };

        let parsed = (|| -> std::result::Result<NewCurrencyTransaction, RowError> {
            Ok(NewCurrencyTransaction {
                ledger_id,
                date: row.date("Date")?,
                txn_type: row.parse_enum(
                    "Type",
                    CurrencyTransactionType::parse,
                    "Use one of ExchangeBuy, ExchangeSell, Spend, Interest, InitialBalance, OtherIncome, Deposit, Withdraw, OtherExpense",
                )?,
                foreign_amount: row.decimal("ForeignAmount")?,
                home_amount: row.optional_decimal("HomeAmount")?,
                exchange_rate: row.optional_decimal("ExchangeRate")?,
            })
        })();

        match parsed {
            Ok(new) => rows.push(new),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Ok(report(total, 0, errors));
    }

    // Second pass inside one transaction; a business-rule failure on any
    // row rolls everything back.
    let mut row_errors: Vec<RowError> = Vec::new();
    {
        let ledger_row = ledger::get_ledger(conn, ledger_id)?;
        let tx = conn.transaction()?;
        let mut affected_days: Vec<NaiveDate> = Vec::new();

        for (index, new) in rows.iter().enumerate() {
            match ledger::validate_and_insert_in_tx(&tx, &ledger_row, new) {
                Ok(_) => {
                    if new.txn_type.is_external_cash_flow() && !affected_days.contains(&new.date) {
                        affected_days.push(new.date);
                    }
                }
                Err(e) => {
                    row_errors.push(RowError {
                        row_number: index + 2,
                        field_name: "Type".into(),
                        invalid_value: new.txn_type.as_str().into(),
                        error_code: "BusinessRule".into(),
                        message: e.to_string(),
                        correction_guidance: "Check the ledger's allowed types and amounts".into(),
                    });
                }
            }
        }

        if row_errors.is_empty() {
            for date in affected_days {
                for portfolio_id in ledger::portfolios_bound_to(&tx, ledger_id)? {
                    snapshots::rebuild_day(&tx, market, portfolio_id, date)?;
                }
            }
            tx.commit()?;
            return Ok(report(total, total, Vec::new()));
        }
        // Drop the transaction: zero rows committed.
    }

    Ok(report(total, 0, row_errors))
}

/// Export a ledger's non-deleted transactions in the import column order.
pub fn export_currency_transactions<W: Write>(
    conn: &Connection,
    user_id: i64,
    ledger_id: i64,
    writer: W,
) -> Result<usize> {
    ledger::get_ledger_owned(conn, ledger_id, user_id)?;

    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(["Date", "Type", "ForeignAmount", "HomeAmount", "ExchangeRate"])
        .map_err(|e| AppError::Unexpected(e.into()))?;

    let entries = ledger::entries(conn, ledger_id, None)?;
    for entry in &entries {
        csv_writer
            .write_record([
                entry.date.to_string(),
                entry.txn_type.as_str().to_string(),
                entry.foreign_amount.to_string(),
                entry.home_amount.map(|h| h.to_string()).unwrap_or_default(),
                entry
                    .exchange_rate
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
            ])
            .map_err(|e| AppError::Unexpected(e.into()))?;
    }
    csv_writer.flush().map_err(|e| AppError::Unexpected(e.into()))?;
    Ok(entries.len())
}

// =============================================================================
// Stock transactions
// =============================================================================

/// Row-by-row import through the normal create path: valid rows settle
/// with their ledger events, invalid rows are reported and skipped.
pub fn import_stock_transactions<R: Read>(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    portfolio_id: i64,
    reader: R,
) -> Result<ImportReport> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| AppError::BusinessRule(format!("unreadable CSV header: {}", e)))?
        .clone();

    let mut errors: Vec<RowError> = Vec::new();
    let mut inserted = 0usize;
    let mut total = 0usize;

    for (index, record) in csv_reader.records().enumerate() {
        total += 1;
        let row_number = index + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                errors.push(RowError {
                    row_number,
                    field_name: String::new(),
                    invalid_value: String::new(),
                    error_code: "MalformedRow".into(),
                    message: e.to_string(),
                    correction_guidance: "Fix the CSV quoting or column count".into(),
                });
                continue;
            }
        };
        let row = RowReader {
            headers: &headers,
            record: &record,
            row_number,
        };

        let parsed = (|| -> std::result::Result<NewStockTransaction, RowError> {
            let txn_type = row.parse_enum(
                "Type",
                StockTransactionType::parse,
                "Use Buy or Sell",
            )?;
            if !matches!(txn_type, StockTransactionType::Buy | StockTransactionType::Sell) {
                return Err(row.error(
                    "Type",
                    "InvalidValue",
                    format!("{} rows cannot be imported", txn_type.as_str()),
                    "Use Buy or Sell",
                ));
            }
            Ok(NewStockTransaction {
                portfolio_id,
                date: row.date("Date")?,
                ticker: row.required("Ticker")?.to_string(),
                market: row.parse_enum("Market", StockMarket::parse, "Use TW, US, UK or EU")?,
                txn_type,
                shares: row.decimal("Shares")?,
                price_per_share: row.decimal("Price")?,
                fees: row.optional_decimal("Fees")?.unwrap_or(Decimal::ZERO),
                currency: row.parse_enum(
                    "Currency",
                    Currency::parse,
                    "Use TWD, USD, GBP or EUR",
                )?,
                fund_source: row.parse_enum(
                    "FundSource",
                    FundSource::parse,
                    "Use None or CurrencyLedger",
                )?,
                balance_action: BalanceAction::None,
                top_up_type: None,
            })
        })();

        match parsed {
            Ok(new) => match transactions::create_stock_transaction(conn, market, user_id, &new) {
                Ok(_) => inserted += 1,
                Err(e) => errors.push(RowError {
                    row_number,
                    field_name: String::new(),
                    invalid_value: String::new(),
                    error_code: e.code().to_string(),
                    message: e.to_string(),
                    correction_guidance: "Review the row against the ledger and portfolio rules"
                        .into(),
                }),
            },
            Err(e) => errors.push(e),
        }
    }

    Ok(report(total, inserted, errors))
}

/// Export a portfolio's non-deleted stock transactions in the import
/// column order.
pub fn export_stock_transactions<W: Write>(
    conn: &Connection,
    user_id: i64,
    portfolio_id: i64,
    writer: W,
) -> Result<usize> {
    crate::portfolios::get_portfolio_owned(conn, portfolio_id, user_id)?;

    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record([
            "Date",
            "Ticker",
            "Market",
            "Currency",
            "Type",
            "Shares",
            "Price",
            "Fees",
            "FundSource",
            "LedgerId",
        ])
        .map_err(|e| AppError::Unexpected(e.into()))?;

    let txns = transactions::get_by_portfolio(conn, portfolio_id, false)?;
    for txn in &txns {
        csv_writer
            .write_record([
                txn.date.to_string(),
                txn.ticker.clone(),
                txn.market.as_str().to_string(),
                txn.currency.as_str().to_string(),
                txn.txn_type.as_str().to_string(),
                txn.shares.to_string(),
                txn.price_per_share.to_string(),
                txn.fees.to_string(),
                txn.fund_source.as_str().to_string(),
                txn.currency_ledger_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            ])
            .map_err(|e| AppError::Unexpected(e.into()))?;
    }
    csv_writer.flush().map_err(|e| AppError::Unexpected(e.into()))?;
    Ok(txns.len())
}
