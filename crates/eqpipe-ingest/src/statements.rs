//! Financial statements stored as long-format fact rows, one table per
//! statement kind.

use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use eqpipe_core::{AuditEntry, FactRow, StatementCell, StatementKind};
use eqpipe_sources::StatementFetcher;
use eqpipe_store::{append_audit, upsert_fact};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestSettings;
use crate::{EntityError, IngestError, IngestSummary};

pub const STATEMENTS_STAGE: &str = "statements";

/// Statements with fewer rows than this are still stored but logged as suspicious.
pub const SPARSE_STATEMENT_ROWS: usize = 5;

/// Parses a reported period (`2024-03-31`, `2024-03-31 00:00:00`,
/// `2024-03-31T00:00:00Z`) into its calendar date.
pub fn parse_period(period: &str) -> Option<NaiveDate> {
    let period = period.trim();
    let date = period.get(..10)?;
    match period.as_bytes().get(10) {
        None | Some(b' ') | Some(b'T') => NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
        Some(_) => None,
    }
}

/// Fiscal year a period-end date belongs to, labelled by the calendar year in
/// which that fiscal year starts. With a March year end, 2024-03-31 is FY 2023
/// and 2024-06-30 is FY 2024.
pub fn fiscal_year_for(date: NaiveDate, fiscal_year_end_month: u32) -> i32 {
    if fiscal_year_end_month < 12 && date.month() <= fiscal_year_end_month {
        date.year() - 1
    } else {
        date.year()
    }
}

/// Converts reported cells into fact rows, dropping cells without a numeric
/// value or with an unparseable period.
pub fn to_fact_rows(
    symbol: &str,
    cells: &[StatementCell],
    settings: &IngestSettings,
    observed_at: DateTime<Utc>,
) -> Vec<FactRow> {
    cells
        .iter()
        .filter_map(|cell| {
            let value = cell.value.filter(|v| v.is_finite())?;
            let fiscal_date = parse_period(&cell.period)?;
            Some(FactRow {
                symbol: symbol.to_string(),
                metric_name: cell.metric_name.clone(),
                fiscal_year: fiscal_year_for(fiscal_date, settings.fiscal_year_end_month),
                fiscal_date,
                value,
                source: settings.source_name.clone(),
                observed_at,
            })
        })
        .collect()
}

pub struct StatementIngestor {
    pool: SqlitePool,
    settings: IngestSettings,
}

impl StatementIngestor {
    pub fn new(pool: SqlitePool, settings: IngestSettings) -> Self {
        Self { pool, settings }
    }

    /// Stores every statement kind for every symbol.
    ///
    /// Each (symbol, statement) pair is written in its own savepoint and
    /// audited on its own; a symbol counts as succeeded only when all of its
    /// statements landed. Symbols commit individually, and cancellation is
    /// checked between symbols.
    pub async fn ingest_all(
        &self,
        symbols: &[String],
        fetcher: &dyn StatementFetcher,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let started = Instant::now();
        let total = symbols.len();
        let mut summary = IngestSummary::default();

        for (position, symbol) in symbols.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.elapsed = started.elapsed();
                warn!(stage = STATEMENTS_STAGE, processed = summary.processed(), total, "interrupted");
                return Err(IngestError::Interrupted { summary, total });
            }

            info!(stage = STATEMENTS_STAGE, symbol = %symbol, position = position + 1, total, "processing");
            let observed_at = Utc::now();
            let mut tx = self.pool.begin().await?;
            let mut all_stored = true;
            for kind in StatementKind::ALL {
                let table = kind.table_name();
                match self.store_statement(&mut tx, fetcher, symbol, kind, observed_at).await {
                    Ok(rows) => {
                        if rows < SPARSE_STATEMENT_ROWS {
                            warn!(symbol = %symbol, table, rows, "statement returned very few rows");
                        }
                        info!(symbol = %symbol, table, rows, "statement stored");
                        append_audit(&mut tx, &AuditEntry::success(STATEMENTS_STAGE, symbol, table, rows)).await?;
                    }
                    Err(err) => {
                        error!(symbol = %symbol, table, error = %err, "statement failed");
                        append_audit(&mut tx, &AuditEntry::failure(STATEMENTS_STAGE, symbol, table, &err)).await?;
                        all_stored = false;
                    }
                }
            }
            tx.commit().await?;

            if all_stored {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            stage = STATEMENTS_STAGE,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "statement ingestion finished"
        );
        Ok(summary)
    }

    async fn store_statement(
        &self,
        conn: &mut SqliteConnection,
        fetcher: &dyn StatementFetcher,
        symbol: &str,
        kind: StatementKind,
        observed_at: DateTime<Utc>,
    ) -> Result<usize, EntityError> {
        let cells = fetcher.fetch_statement(symbol, kind).await?;
        let facts = to_fact_rows(symbol, &cells, &self.settings, observed_at);

        let mut savepoint = conn.begin().await?;
        for fact in &facts {
            if let Err(err) = upsert_fact(&mut savepoint, kind.table_name(), fact).await {
                savepoint.rollback().await?;
                return Err(err.into());
            }
        }
        savepoint.commit().await?;
        Ok(facts.len())
    }
}
