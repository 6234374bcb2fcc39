//! User and portfolio records.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db;
use crate::error::{AppError, Result};
use crate::ledger;
use crate::models::{Portfolio, User};
use crate::money::Currency;

pub fn create_user(conn: &Connection, name: &str, home_currency: Currency) -> Result<User> {
    conn.execute(
        "INSERT INTO user (name, home_currency, created_at) VALUES (?1, ?2, ?3)",
        params![name, home_currency.as_str(), db::now()],
    )?;
    get_user(conn, conn.last_insert_rowid())
}

pub fn get_user(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row(
        "SELECT id, name, home_currency, created_at FROM user WHERE id = ?1",
        [id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
                home_currency: db::enum_col(row, 2, Currency::parse)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::EntityNotFound(format!("user {}", id)))
}

#[derive(Debug, Clone)]
pub struct NewPortfolio {
    pub user_id: i64,
    pub name: String,
    pub base_currency: Currency,
    pub home_currency: Currency,
    pub bound_ledger_id: Option<i64>,
}

pub fn create_portfolio(conn: &Connection, new: &NewPortfolio) -> Result<Portfolio> {
    if let Some(ledger_id) = new.bound_ledger_id {
        // The bound ledger must exist and belong to the same user.
        let bound = ledger::get_ledger(conn, ledger_id)?;
        if bound.user_id != new.user_id {
            return Err(AppError::AccessDenied(format!(
                "currency ledger {}",
                ledger_id
            )));
        }
    }

    conn.execute(
        r#"INSERT INTO portfolio
               (user_id, name, base_currency, home_currency, bound_ledger_id, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)"#,
        params![
            new.user_id,
            new.name,
            new.base_currency.as_str(),
            new.home_currency.as_str(),
            new.bound_ledger_id,
            db::now(),
        ],
    )?;
    get_portfolio(conn, conn.last_insert_rowid())
}

pub fn get_portfolio(conn: &Connection, id: i64) -> Result<Portfolio> {
    conn.query_row(
        r#"SELECT id, user_id, name, base_currency, home_currency, bound_ledger_id,
                  created_at, updated_at
           FROM portfolio WHERE id = ?1"#,
        [id],
        map_portfolio_row,
    )
    .optional()?
    .ok_or_else(|| AppError::EntityNotFound(format!("portfolio {}", id)))
}

/// Fetch with an ownership check; a foreign owner sees 403, not 404.
pub fn get_portfolio_owned(conn: &Connection, id: i64, user_id: i64) -> Result<Portfolio> {
    let portfolio = get_portfolio(conn, id)?;
    if portfolio.user_id != user_id {
        return Err(AppError::AccessDenied(format!("portfolio {}", id)));
    }
    Ok(portfolio)
}

pub fn list_portfolios(conn: &Connection, user_id: i64) -> Result<Vec<Portfolio>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, user_id, name, base_currency, home_currency, bound_ledger_id,
                  created_at, updated_at
           FROM portfolio WHERE user_id = ?1 ORDER BY name"#,
    )?;
    let portfolios = stmt
        .query_map([user_id], map_portfolio_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(portfolios)
}

fn map_portfolio_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Portfolio> {
    Ok(Portfolio {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        base_currency: db::enum_col(row, 3, Currency::parse)?,
        home_currency: db::enum_col(row, 4, Currency::parse)?,
        bound_ledger_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_portfolio_roundtrip() {
        let conn = test_db();
        let portfolio = create_portfolio(
            &conn,
            &NewPortfolio {
                user_id: 1,
                name: "tw stocks".into(),
                base_currency: Currency::Twd,
                home_currency: Currency::Twd,
                bound_ledger_id: None,
            },
        )
        .unwrap();

        let fetched = get_portfolio_owned(&conn, portfolio.id, 1).unwrap();
        assert_eq!(fetched.name, "tw stocks");
        assert!(fetched.bound_ledger_id.is_none());
    }

    #[test]
    fn test_binding_foreign_ledger_denied() {
        let conn = test_db();
        create_user(&conn, "bob", Currency::Twd).unwrap();
        let ledger = crate::ledger::create_ledger(
            &conn,
            &crate::ledger::NewLedger {
                user_id: 2,
                currency: Currency::Usd,
                home_currency: Currency::Twd,
                name: "bobs usd".into(),
            },
        )
        .unwrap();

        let result = create_portfolio(
            &conn,
            &NewPortfolio {
                user_id: 1,
                name: "sneaky".into(),
                base_currency: Currency::Usd,
                home_currency: Currency::Twd,
                bound_ledger_id: Some(ledger.id),
            },
        );
        assert!(matches!(result, Err(AppError::AccessDenied(_))));
    }

    #[test]
    fn test_missing_portfolio_not_found() {
        let conn = test_db();
        assert!(matches!(
            get_portfolio(&conn, 99),
            Err(AppError::EntityNotFound(_))
        ));
    }
}
