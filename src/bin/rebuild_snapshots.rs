//! Re-derive every transaction snapshot from the current logs and the
//! price cache.
//!
//! Run with: cargo run --bin rebuild_snapshots

use anyhow::Result;
use std::path::PathBuf;

use investment_tracker::marketdata::CachedMarketData;
use investment_tracker::{db, ledger, portfolios, snapshots, transactions, Config};

fn main() -> Result<()> {
    let config = Config::from_env();
    let db_path = PathBuf::from(&config.database_path);

    println!("Opening database: {:?}", db_path);
    let conn = db::init_database(&db_path)?;

    let mut stmt = conn.prepare("SELECT id FROM portfolio ORDER BY id")?;
    let portfolio_ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let market = CachedMarketData::new(&conn);
    let mut rebuilt_days = 0usize;

    for portfolio_id in portfolio_ids {
        let portfolio = portfolios::get_portfolio(&conn, portfolio_id)?;
        let mut dates = Vec::new();
        for txn in transactions::get_by_portfolio(&conn, portfolio_id, false)? {
            if !dates.contains(&txn.date) {
                dates.push(txn.date);
            }
        }
        if let Some(ledger_id) = portfolio.bound_ledger_id {
            for entry in ledger::entries(&conn, ledger_id, None)? {
                if entry.txn_type.is_external_cash_flow() && !dates.contains(&entry.date) {
                    dates.push(entry.date);
                }
            }
        }

        println!("Portfolio {}: rebuilding {} days", portfolio_id, dates.len());
        for date in dates {
            snapshots::rebuild_day(&conn, &market, portfolio_id, date)?;
            rebuilt_days += 1;
        }
    }

    println!("Done! Rebuilt {} days.", rebuilt_days);
    Ok(())
}
