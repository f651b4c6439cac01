//! Live schema introspection and additive column evolution.

use std::collections::BTreeSet;

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info};

use crate::{quote_ident, StoreError, StoreResult};

/// Column names of `table` in declaration order. Empty when the table is missing.
pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> StoreResult<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter()
        .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
        .collect()
}

/// Adds every column in `columns` that `table` lacks, as nullable TEXT.
///
/// Returns the names that were added by this call. Calling again with the same
/// or overlapping names is a no-op beyond the introspection query, and a column
/// added concurrently by another process is treated as already present.
pub async fn ensure_columns<'a, I>(
    conn: &mut SqliteConnection,
    table: &str,
    columns: I,
) -> StoreResult<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let existing: BTreeSet<String> = table_columns(conn, table)
        .await?
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if existing.is_empty() {
        return Err(StoreError::UnknownTable {
            table: table.to_string(),
        });
    }

    let mut added = Vec::new();
    let mut seen = BTreeSet::new();
    for column in columns {
        if column.is_empty() {
            return Err(StoreError::InvalidIdentifier(column.to_string()));
        }
        // SQLite column names are case-insensitive.
        let folded = column.to_ascii_lowercase();
        if existing.contains(&folded) || !seen.insert(folded) {
            continue;
        }

        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT",
            quote_ident(table),
            quote_ident(column)
        );
        match sqlx::query(&ddl).execute(&mut *conn).await {
            Ok(_) => added.push(column.to_string()),
            Err(sqlx::Error::Database(err)) if err.message().contains("duplicate column name") => {
                debug!(table, column, "column added concurrently");
            }
            Err(err) => return Err(err.into()),
        }
    }

    if !added.is_empty() {
        info!(table, added = added.len(), "schema evolved");
    }
    Ok(added)
}
