//! Merge-upsert writes: attribute replacement and differential fact merges.

use eqpipe_core::{ColumnMap, ColumnValue, FactRow};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};

use crate::{format_ts, quote_ident, StoreError, StoreResult};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &ColumnValue) -> SqliteQuery<'q> {
    match value {
        ColumnValue::Null => query.bind(None::<String>),
        ColumnValue::Integer(i) => query.bind(*i),
        ColumnValue::Real(r) => query.bind(*r),
        ColumnValue::Text(s) => query.bind(s.clone()),
    }
}

fn describe_key(row: &ColumnMap, key_fields: &[&str]) -> String {
    key_fields
        .iter()
        .map(|k| match row.get(*k) {
            Some(v) => format!("{k}={v}"),
            None => format!("{k}=<missing>"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT .. ON CONFLICT(keys) DO UPDATE` replacing every non-key column.
pub fn build_upsert_sql(table: &str, columns: &[&str], key_fields: &[&str]) -> String {
    let col_sql = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let keys = key_fields.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let updates = columns
        .iter()
        .filter(|c| !key_fields.contains(c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect::<Vec<_>>();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({col_sql}) VALUES ({placeholders}) ON CONFLICT({keys}) {action}",
        quote_ident(table)
    )
}

/// Inserts `row` or, on key conflict, overwrites every non-key column with the
/// incoming value. Re-applying an identical row leaves the stored row unchanged.
pub async fn upsert(
    conn: &mut SqliteConnection,
    table: &str,
    row: &ColumnMap,
    key_fields: &[&str],
) -> StoreResult<()> {
    let rejected = |reason: String| StoreError::WriteRejected {
        table: table.to_string(),
        key: describe_key(row, key_fields),
        reason,
    };

    if key_fields.is_empty() {
        return Err(rejected("no key fields given".into()));
    }
    for key in key_fields {
        match row.get(*key) {
            None => return Err(rejected(format!("key column {key} missing from row"))),
            Some(v) if v.is_null() => return Err(rejected(format!("key column {key} is null"))),
            Some(_) => {}
        }
    }

    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let sql = build_upsert_sql(table, &columns, key_fields);
    let mut query = sqlx::query(&sql);
    for value in row.values() {
        query = bind_value(query, value);
    }
    query
        .execute(&mut *conn)
        .await
        .map_err(|err| rejected(err.to_string()))?;
    Ok(())
}

/// Merges one fact row with the differential rule.
///
/// The stored value is replaced only when the incoming value is non-null,
/// non-zero and different. `source` and `value_changed_ts` move with the
/// value, `last_observed_ts` always moves, `first_seen_ts` never does.
pub async fn upsert_fact(conn: &mut SqliteConnection, table: &str, fact: &FactRow) -> StoreResult<()> {
    let t = quote_ident(table);
    let changed = format!(
        "excluded.value IS NOT NULL AND excluded.value != 0 AND excluded.value != {t}.value"
    );
    let sql = format!(
        "INSERT INTO {t} (
            symbol, metric_name, fiscal_year, fiscal_date, value, source,
            first_seen_ts, value_changed_ts, last_observed_ts
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(symbol, metric_name, fiscal_year) DO UPDATE SET
            value = CASE WHEN {changed} THEN excluded.value ELSE {t}.value END,
            source = CASE WHEN {changed} THEN excluded.source ELSE {t}.source END,
            fiscal_date = COALESCE(excluded.fiscal_date, {t}.fiscal_date),
            value_changed_ts = CASE WHEN {changed} THEN excluded.value_changed_ts ELSE {t}.value_changed_ts END,
            last_observed_ts = excluded.last_observed_ts"
    );

    let observed = format_ts(fact.observed_at);
    sqlx::query(&sql)
        .bind(&fact.symbol)
        .bind(&fact.metric_name)
        .bind(fact.fiscal_year)
        .bind(fact.fiscal_date.format("%Y-%m-%d").to_string())
        .bind(fact.value)
        .bind(&fact.source)
        .bind(&observed)
        .bind(&observed)
        .bind(&observed)
        .execute(&mut *conn)
        .await
        .map_err(|err| StoreError::WriteRejected {
            table: table.to_string(),
            key: format!(
                "symbol={}, metric_name={}, fiscal_year={}",
                fact.symbol, fact.metric_name, fact.fiscal_year
            ),
            reason: err.to_string(),
        })?;
    Ok(())
}
