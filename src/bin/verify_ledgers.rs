//! Recompute every ledger balance from its transaction log and print the
//! result, so drift from a bad migration or manual edit is visible.
//!
//! Run with: cargo run --bin verify_ledgers

use anyhow::Result;
use std::path::PathBuf;

use investment_tracker::{db, ledger, Config};

fn main() -> Result<()> {
    let config = Config::from_env();
    let db_path = PathBuf::from(&config.database_path);

    println!("Opening database: {:?}", db_path);
    let conn = db::init_database(&db_path)?;

    let mut stmt = conn.prepare("SELECT id, user_id FROM currency_ledger ORDER BY id")?;
    let ledgers: Vec<(i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .filter_map(|r| r.ok())
        .collect();

    println!("Checking {} ledgers...\n", ledgers.len());

    for (ledger_id, user_id) in ledgers {
        let summary = ledger::ledger_summary(&conn, ledger_id, user_id)?;
        let first = ledger::project(&ledger::entries(&conn, ledger_id, None)?);
        let second = ledger::project(&ledger::entries(&conn, ledger_id, None)?);

        let stable = first.balance == second.balance
            && first.realized_pnl_home == second.realized_pnl_home;

        println!(
            "ledger {:>4} [{}]: balance {:>16}, layers {:>2}, realized {:>12} {}",
            ledger_id,
            summary.currency,
            summary.balance,
            summary.layers.len(),
            summary.realized_pnl_home,
            if stable { "ok" } else { "UNSTABLE" },
        );
    }

    println!("\nDone!");
    Ok(())
}
