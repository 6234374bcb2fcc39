//! Multi-currency investment tracking engine.
//!
//! Tracks a household's stock holdings and per-currency cash ledgers
//! against an authoritative, soft-deleted transaction log. Stock buys
//! funded from a ledger consume LIFO cost layers to settle their
//! effective exchange rate; every value-shifting event records a
//! before/after portfolio snapshot; the performance module folds those
//! snapshots into XIRR, Modified Dietz and time-weighted returns in both
//! the instrument currency and the home currency.
//!
//! The HTTP surface, authentication and UI live outside this crate; the
//! modules here expose the semantic operations those layers call.

pub mod config;
pub mod csv_io;
pub mod db;
pub mod error;
pub mod ledger;
pub mod marketdata;
pub mod models;
pub mod money;
pub mod performance;
pub mod portfolios;
pub mod positions;
pub mod snapshots;
pub mod splits;
pub mod transactions;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use error::{AppError, Result};
