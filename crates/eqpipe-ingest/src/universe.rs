//! Listed-equity universe snapshot: validation, normalization and atomic refresh.

use std::collections::BTreeSet;

use chrono::{NaiveDate, Utc};
use eqpipe_core::UniverseRecord;
use eqpipe_store::{replace_universe, StoreError};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::UniverseSettings;

pub const UNIVERSE_STAGE: &str = "universe";

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("universe snapshot is empty")]
    Empty,
    #[error("universe snapshot has {rows} rows, expected at least {min}")]
    TooFewRows { rows: usize, min: usize },
    #[error("universe record {position} has no symbol")]
    MissingSymbol { position: usize },
    #[error("universe record {symbol} has no ISIN")]
    MissingIsin { symbol: String },
    #[error("symbol {symbol} listed under more than one ISIN")]
    DuplicateSymbol { symbol: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Converts an exchange listing date (`06-OCT-2008`) to ISO form. ISO input
/// passes through; anything else yields `None`.
pub fn normalize_listing_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d-%b-%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Normalizes and validates a fetched snapshot. Records sharing an ISIN keep
/// the first occurrence; any other defect rejects the whole snapshot.
pub fn prepare_snapshot(
    records: Vec<UniverseRecord>,
    settings: &UniverseSettings,
) -> Result<Vec<UniverseRecord>, UniverseError> {
    if records.is_empty() {
        return Err(UniverseError::Empty);
    }

    let mut seen_isins = BTreeSet::new();
    let mut seen_symbols = BTreeSet::new();
    let mut prepared = Vec::with_capacity(records.len());
    for (position, record) in records.into_iter().enumerate() {
        let symbol = record.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(UniverseError::MissingSymbol { position });
        }
        let Some(isin) = clean(record.isin_number).map(|i| i.to_ascii_uppercase()) else {
            return Err(UniverseError::MissingIsin { symbol });
        };
        if !seen_isins.insert(isin.clone()) {
            warn!(symbol = %symbol, isin = %isin, "dropping duplicate ISIN");
            continue;
        }
        if !seen_symbols.insert(symbol.clone()) {
            return Err(UniverseError::DuplicateSymbol { symbol });
        }

        prepared.push(UniverseRecord {
            symbol,
            name_of_company: clean(record.name_of_company),
            series: clean(record.series),
            date_of_listing: clean(record.date_of_listing).and_then(|d| normalize_listing_date(&d)),
            paid_up_value: record.paid_up_value,
            market_lot: record.market_lot,
            isin_number: Some(isin),
            face_value: record.face_value,
        });
    }

    if prepared.len() < settings.min_rows {
        return Err(UniverseError::TooFewRows {
            rows: prepared.len(),
            min: settings.min_rows,
        });
    }
    Ok(prepared)
}

/// Validates `records` and swaps them in as the current universe. On any
/// validation failure the stored universe is left untouched.
pub async fn refresh_universe(
    pool: &SqlitePool,
    records: Vec<UniverseRecord>,
    settings: &UniverseSettings,
) -> Result<usize, UniverseError> {
    let fetched = records.len();
    let prepared = prepare_snapshot(records, settings)?;
    let stored = replace_universe(pool, &prepared, &settings.source_name, Utc::now()).await?;
    info!(stage = UNIVERSE_STAGE, fetched, stored, "equity universe refreshed");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_pool;
    use eqpipe_store::load_symbols;

    fn record(symbol: &str, isin: Option<&str>) -> UniverseRecord {
        UniverseRecord {
            symbol: symbol.to_string(),
            name_of_company: Some(format!(" {symbol} Limited ")),
            series: Some("EQ".into()),
            date_of_listing: Some("25-AUG-2004".into()),
            paid_up_value: Some(1.0),
            market_lot: Some(1.0),
            isin_number: isin.map(str::to_string),
            face_value: Some(1.0),
        }
    }

    fn settings(min_rows: usize) -> UniverseSettings {
        UniverseSettings {
            source_name: "NSE".into(),
            min_rows,
        }
    }

    #[test]
    fn listing_dates_are_normalized() {
        assert_eq!(normalize_listing_date("25-AUG-2004").as_deref(), Some("2004-08-25"));
        assert_eq!(normalize_listing_date("06-Oct-2008").as_deref(), Some("2008-10-06"));
        assert_eq!(normalize_listing_date("2008-10-06").as_deref(), Some("2008-10-06"));
        assert_eq!(normalize_listing_date("sometime"), None);
    }

    #[test]
    fn snapshot_is_normalized_and_deduplicated() {
        let prepared = prepare_snapshot(
            vec![
                record(" tcs ", Some("INE467B01029")),
                record("TCSDUP", Some("ine467b01029")),
                record("INFY", Some("INE009A01021")),
            ],
            &settings(2),
        )
        .unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].symbol, "TCS");
        assert_eq!(prepared[0].name_of_company.as_deref(), Some("tcs  Limited"));
        assert_eq!(prepared[0].date_of_listing.as_deref(), Some("2004-08-25"));
    }

    #[test]
    fn invalid_snapshots_are_rejected() {
        assert!(matches!(prepare_snapshot(vec![], &settings(0)), Err(UniverseError::Empty)));
        assert!(matches!(
            prepare_snapshot(vec![record("TCS", Some("INE467B01029"))], &settings(1000)),
            Err(UniverseError::TooFewRows { rows: 1, min: 1000 })
        ));
        assert!(matches!(
            prepare_snapshot(vec![record("TCS", Some("  "))], &settings(0)),
            Err(UniverseError::MissingIsin { .. })
        ));
        assert!(matches!(
            prepare_snapshot(
                vec![record("TCS", Some("INE467B01029")), record("tcs", Some("INE000000001"))],
                &settings(0)
            ),
            Err(UniverseError::DuplicateSymbol { .. })
        ));
    }

    #[tokio::test]
    async fn failed_validation_keeps_previous_universe() {
        let (_dir, pool) = temp_pool().await;
        refresh_universe(&pool, vec![record("TCS", Some("INE467B01029"))], &settings(1))
            .await
            .unwrap();

        let err = refresh_universe(&pool, vec![record("INFY", None)], &settings(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UniverseError::MissingIsin { .. }));
        assert_eq!(load_symbols(&pool).await.unwrap(), vec!["TCS"]);
    }
}
