//! SQLite persistence layer.
//!
//! Schema migrations are versioned; `init_database` applies every pending
//! migration inside a transaction and records it in `schema_migration`.
//! Decimals are stored as TEXT at their declared scale, dates as ISO-8601
//! text, so lexicographic ordering matches chronological ordering.

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;

use crate::error::Result;

/// Ordered migration batches. Append only; never edit an applied version.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        home_currency TEXT NOT NULL DEFAULT 'TWD',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS portfolio (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        base_currency TEXT NOT NULL,
        home_currency TEXT NOT NULL DEFAULT 'TWD',
        bound_ledger_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES user(id),
        FOREIGN KEY (bound_ledger_id) REFERENCES currency_ledger(id)
    );

    CREATE TABLE IF NOT EXISTS currency_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        currency TEXT NOT NULL,
        home_currency TEXT NOT NULL DEFAULT 'TWD',
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES user(id)
    );

    -- At most one active ledger per (user, currency).
    CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_user_currency_active
        ON currency_ledger(user_id, currency) WHERE is_active = 1;

    CREATE TABLE IF NOT EXISTS stock_transaction (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        portfolio_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        ticker TEXT NOT NULL,
        market TEXT NOT NULL,
        txn_type TEXT NOT NULL,
        shares TEXT NOT NULL,
        price_per_share TEXT NOT NULL,
        exchange_rate TEXT NOT NULL,
        fees TEXT NOT NULL DEFAULT '0',
        currency TEXT NOT NULL,
        fund_source TEXT NOT NULL DEFAULT 'None',
        currency_ledger_id INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (portfolio_id) REFERENCES portfolio(id),
        FOREIGN KEY (currency_ledger_id) REFERENCES currency_ledger(id)
    );

    CREATE INDEX IF NOT EXISTS idx_stock_txn_portfolio
        ON stock_transaction(portfolio_id);
    CREATE INDEX IF NOT EXISTS idx_stock_txn_portfolio_date
        ON stock_transaction(portfolio_id, date);

    CREATE TABLE IF NOT EXISTS currency_transaction (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        ledger_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        txn_type TEXT NOT NULL,
        foreign_amount TEXT NOT NULL,
        home_amount TEXT,
        exchange_rate TEXT,
        related_stock_transaction_id INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (ledger_id) REFERENCES currency_ledger(id),
        FOREIGN KEY (related_stock_transaction_id) REFERENCES stock_transaction(id)
    );

    CREATE INDEX IF NOT EXISTS idx_currency_txn_ledger
        ON currency_transaction(ledger_id);
    CREATE INDEX IF NOT EXISTS idx_currency_txn_related
        ON currency_transaction(related_stock_transaction_id);

    CREATE TABLE IF NOT EXISTS stock_split (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        market TEXT NOT NULL,
        split_date TEXT NOT NULL,
        ratio TEXT NOT NULL,
        description TEXT,
        UNIQUE (symbol, market, split_date)
    );

    CREATE TABLE IF NOT EXISTS transaction_snapshot (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portfolio_id INTEGER NOT NULL,
        event_kind TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        snapshot_date TEXT NOT NULL,
        value_before_home TEXT NOT NULL,
        value_after_home TEXT NOT NULL,
        value_before_source TEXT NOT NULL,
        value_after_source TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (event_kind, event_id),
        FOREIGN KEY (portfolio_id) REFERENCES portfolio(id)
    );

    CREATE INDEX IF NOT EXISTS idx_snapshot_portfolio_date
        ON transaction_snapshot(portfolio_id, snapshot_date);

    CREATE TABLE IF NOT EXISTS price_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        market TEXT NOT NULL,
        requested_date TEXT NOT NULL,
        actual_date TEXT,
        price TEXT,
        currency TEXT,
        is_not_available INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (symbol, market, requested_date)
    );

    CREATE TABLE IF NOT EXISTS fx_rate_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_currency TEXT NOT NULL,
        to_currency TEXT NOT NULL,
        requested_date TEXT NOT NULL,
        actual_date TEXT,
        rate TEXT,
        is_not_available INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (from_currency, to_currency, requested_date)
    );

    CREATE TABLE IF NOT EXISTS year_end_price_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        market_key TEXT NOT NULL,
        year_month TEXT NOT NULL,
        price TEXT,
        is_not_available INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (market_key, year_month)
    );
    "#,
)];

/// Open the database at `path` and bring the schema up to date.
pub fn init_database(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

/// In-memory database for tests and ephemeral tooling.
pub fn init_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migration (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );
        "#,
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migration",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        log::info!("Applying schema migration {}", version);
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migration (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, now()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Current UTC wall clock as stored in `created_at` / `updated_at`.
pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

// =============================================================================
// Column helpers
// =============================================================================

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

/// Read a TEXT column as an exact decimal.
pub fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e| conversion_err(idx, format!("bad decimal {:?}: {}", s, e)))
}

pub fn opt_dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| conversion_err(idx, format!("bad decimal {:?}: {}", s, e))),
    }
}

/// Read a TEXT column through a closed-enum parser.
pub fn enum_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    parse(&s).ok_or_else(|| conversion_err(idx, format!("unknown variant {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        apply_migrations(&mut conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migration", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_active_ledger_uniqueness() {
        let conn = init_in_memory().unwrap();
        conn.execute(
            "INSERT INTO user (name, home_currency, created_at) VALUES ('amy', 'TWD', ?1)",
            [now()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO currency_ledger (user_id, currency, home_currency, name, is_active, created_at, updated_at)
             VALUES (1, 'USD', 'TWD', 'usd main', 1, ?1, ?1)",
            [now()],
        )
        .unwrap();

        // Second active USD ledger for the same user violates the partial index.
        let duplicate = conn.execute(
            "INSERT INTO currency_ledger (user_id, currency, home_currency, name, is_active, created_at, updated_at)
             VALUES (1, 'USD', 'TWD', 'usd other', 1, ?1, ?1)",
            [now()],
        );
        assert!(duplicate.is_err());

        // Inactive duplicates are fine.
        conn.execute(
            "INSERT INTO currency_ledger (user_id, currency, home_currency, name, is_active, created_at, updated_at)
             VALUES (1, 'USD', 'TWD', 'usd closed', 0, ?1, ?1)",
            [now()],
        )
        .unwrap();
    }

    #[test]
    fn test_file_backed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");

        {
            let conn = init_database(&path).unwrap();
            conn.execute(
                "INSERT INTO user (name, home_currency, created_at) VALUES ('amy', 'TWD', ?1)",
                [now()],
            )
            .unwrap();
        }

        // Reopening applies no migrations twice and keeps the data.
        let conn = init_database(&path).unwrap();
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM user", [], |row| row.get(0))
            .unwrap();
        assert_eq!(users, 1);
    }

    #[test]
    fn test_split_uniqueness() {
        let conn = init_in_memory().unwrap();
        conn.execute(
            "INSERT INTO stock_split (symbol, market, split_date, ratio) VALUES ('AAPL', 'US', '2020-08-31', '4')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO stock_split (symbol, market, split_date, ratio) VALUES ('AAPL', 'US', '2020-08-31', '4')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
