//! SQLite persistence for the equity pipeline: bootstrap DDL, schema evolution,
//! merge-upserts, the ingestion audit trail and run/step history.

pub mod merge;
pub mod schema;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use eqpipe_core::{AuditEntry, AuditStatus, Run, RunStatus, StatementKind, StepResult, UniverseRecord};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use merge::{upsert, upsert_fact};
pub use schema::{ensure_columns, table_columns};

pub const CRATE_NAME: &str = "eqpipe-store";

pub const STATIC_TABLE: &str = "raw_equity_staticinfo";
pub const DYNAMIC_TABLE: &str = "raw_equity_dynamicinfo";
pub const AUDIT_TABLE: &str = "raw_ingest_log";
pub const UNIVERSE_TABLE: &str = "raw_equity_universe";
pub const RUNS_TABLE: &str = "pipeline_runs";
pub const STEPS_TABLE: &str = "pipeline_steps";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("table {table} does not exist")]
    UnknownTable { table: String },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("write rejected for {table} [{key}]: {reason}")]
    WriteRejected {
        table: String,
        key: String,
        reason: String,
    },
    #[error("corrupt stored value in {table}: {reason}")]
    Corrupt { table: String, reason: String },
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Canonical text form for persisted timestamps; lexicographic order matches time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(table: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt {
            table: table.to_string(),
            reason: format!("timestamp {raw:?}: {err}"),
        })
}

/// Opens a pool for a `sqlite://` URL, creating the file and its directory if missing.
pub async fn connect(database_url: &str) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?;
    connect_with(options).await
}

/// Opens a pool on a database file path.
pub async fn open_path(path: impl AsRef<Path>) -> StoreResult<SqlitePool> {
    connect_with(SqliteConnectOptions::new().filename(path.as_ref())).await
}

async fn connect_with(options: SqliteConnectOptions) -> StoreResult<SqlitePool> {
    let filename = options.get_filename().to_path_buf();
    if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
        if filename.as_os_str() != ":memory:" {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    debug!(path = %filename.display(), "opened sqlite pool");
    Ok(pool)
}

fn fact_table_ddl(table: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                symbol TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                fiscal_year INTEGER NOT NULL,
                fiscal_date TEXT NOT NULL,
                value REAL NOT NULL,
                source TEXT NOT NULL,
                first_seen_ts TEXT NOT NULL,
                value_changed_ts TEXT NOT NULL,
                last_observed_ts TEXT NOT NULL,
                PRIMARY KEY (symbol, metric_name, fiscal_year)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_symbol_year ON {table} (symbol, fiscal_year)"),
    ]
}

/// Creates every fixed table the pipeline relies on. Safe to run repeatedly.
pub async fn bootstrap(pool: &SqlitePool) -> StoreResult<()> {
    let mut statements: Vec<String> = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {RUNS_TABLE} (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {STEPS_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES {RUNS_TABLE}(run_id),
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                duration_secs REAL NOT NULL,
                status TEXT NOT NULL,
                error TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {AUDIT_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                symbol TEXT NOT NULL,
                table_name TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {STATIC_TABLE} (
                symbol TEXT PRIMARY KEY,
                source TEXT,
                ingested_at TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {DYNAMIC_TABLE} (
                symbol TEXT NOT NULL,
                as_of_date TEXT NOT NULL,
                source TEXT,
                ingested_at TEXT,
                extra_payload TEXT,
                PRIMARY KEY (symbol, as_of_date)
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_dynamic_symbol_date ON {DYNAMIC_TABLE} (symbol, as_of_date)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {UNIVERSE_TABLE} (
                symbol TEXT PRIMARY KEY,
                name_of_company TEXT,
                series TEXT,
                date_of_listing TEXT,
                paid_up_value REAL,
                market_lot REAL,
                isin_number TEXT NOT NULL,
                face_value REAL,
                source TEXT NOT NULL,
                ingested_ts TEXT NOT NULL
            )"
        ),
    ];
    for kind in StatementKind::ALL {
        statements.extend(fact_table_ddl(kind.table_name()));
    }

    let mut tx = pool.begin().await?;
    for statement in &statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    info!(tables = statements.len(), "store bootstrap complete");
    Ok(())
}

/// Appends one audit entry. Entries are never updated or deleted.
pub async fn append_audit(conn: &mut SqliteConnection, entry: &AuditEntry) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO {AUDIT_TABLE} (stage, symbol, table_name, ingested_at, item_count, status, error)
         VALUES (?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&entry.stage)
    .bind(&entry.symbol)
    .bind(&entry.table_name)
    .bind(format_ts(entry.recorded_at))
    .bind(entry.item_count)
    .bind(entry.status.as_str())
    .bind(entry.error.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Audit entries for one symbol in insertion order.
pub async fn audit_entries_for(pool: &SqlitePool, symbol: &str) -> StoreResult<Vec<AuditEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT stage, symbol, table_name, ingested_at, item_count, status, error
         FROM {AUDIT_TABLE} WHERE symbol = ? ORDER BY id"
    ))
    .bind(symbol)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> StoreResult<AuditEntry> {
            let status: String = row.try_get("status")?;
            let status = match status.as_str() {
                "SUCCESS" => AuditStatus::Success,
                "FAILED" => AuditStatus::Failed,
                other => {
                    return Err(StoreError::Corrupt {
                        table: AUDIT_TABLE.to_string(),
                        reason: format!("audit status {other:?}"),
                    })
                }
            };
            let recorded_at: String = row.try_get("ingested_at")?;
            Ok(AuditEntry {
                stage: row.try_get("stage")?,
                symbol: row.try_get("symbol")?,
                table_name: row.try_get("table_name")?,
                recorded_at: parse_ts(AUDIT_TABLE, &recorded_at)?,
                item_count: row.try_get("item_count")?,
                status,
                error: row.try_get("error")?,
            })
        })
        .collect()
}

/// Symbols of the current equity universe, sorted.
pub async fn load_symbols(pool: &SqlitePool) -> StoreResult<Vec<String>> {
    let symbols = sqlx::query_scalar::<_, String>(&format!(
        "SELECT symbol FROM {UNIVERSE_TABLE} ORDER BY symbol"
    ))
    .fetch_all(pool)
    .await?;
    Ok(symbols)
}

/// Atomically replaces the universe snapshot. Either every record lands or none do.
pub async fn replace_universe(
    pool: &SqlitePool,
    records: &[UniverseRecord],
    source: &str,
    ingested_at: DateTime<Utc>,
) -> StoreResult<usize> {
    let ingested_ts = format_ts(ingested_at);
    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DELETE FROM {UNIVERSE_TABLE}"))
        .execute(&mut *tx)
        .await?;

    let sql = format!(
        "INSERT INTO {UNIVERSE_TABLE} (
            symbol, name_of_company, series, date_of_listing, paid_up_value,
            market_lot, isin_number, face_value, source, ingested_ts
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    for record in records {
        sqlx::query(&sql)
            .bind(&record.symbol)
            .bind(record.name_of_company.as_deref())
            .bind(record.series.as_deref())
            .bind(record.date_of_listing.as_deref())
            .bind(record.paid_up_value)
            .bind(record.market_lot)
            .bind(record.isin_number.as_deref())
            .bind(record.face_value)
            .bind(source)
            .bind(&ingested_ts)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::WriteRejected {
                table: UNIVERSE_TABLE.to_string(),
                key: format!("symbol={}", record.symbol),
                reason: err.to_string(),
            })?;
    }
    tx.commit().await?;
    Ok(records.len())
}

/// Persists and reads back run history.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Writes a finished run and its steps in one transaction.
    pub async fn record_run(&self, run: &Run) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {RUNS_TABLE} (run_id, started_at, finished_at, status) VALUES (?, ?, ?, ?)"
        ))
        .bind(run.id.to_string())
        .bind(format_ts(run.started_at))
        .bind(run.finished_at.map(format_ts))
        .bind(run.status.as_str())
        .execute(&mut *tx)
        .await?;

        let step_sql = format!(
            "INSERT INTO {STEPS_TABLE} (run_id, position, name, attempts, duration_secs, status, error)
             VALUES (?, ?, ?, ?, ?, ?, ?)"
        );
        for (position, step) in run.steps.iter().enumerate() {
            sqlx::query(&step_sql)
                .bind(run.id.to_string())
                .bind(position as i64)
                .bind(&step.name)
                .bind(i64::from(step.attempts))
                .bind(step.duration.as_secs_f64())
                .bind(step.status.as_str())
                .bind(step.error.as_deref())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(run_id = %run.id, status = %run.status, steps = run.steps.len(), "run persisted");
        Ok(())
    }

    /// Most recent runs first, each with its steps in execution order.
    pub async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT run_id, started_at, finished_at, status FROM {RUNS_TABLE}
             ORDER BY started_at DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let run_id: String = row.try_get("run_id")?;
            let id = Uuid::parse_str(&run_id).map_err(|err| StoreError::Corrupt {
                table: RUNS_TABLE.to_string(),
                reason: format!("run id {run_id:?}: {err}"),
            })?;
            let started_at: String = row.try_get("started_at")?;
            let finished_at: Option<String> = row.try_get("finished_at")?;
            let status: String = row.try_get("status")?;
            runs.push(Run {
                id,
                started_at: parse_ts(RUNS_TABLE, &started_at)?,
                finished_at: finished_at
                    .as_deref()
                    .map(|raw| parse_ts(RUNS_TABLE, raw))
                    .transpose()?,
                status: parse_status(RUNS_TABLE, &status)?,
                steps: self.steps_for(&run_id).await?,
            });
        }
        Ok(runs)
    }

    async fn steps_for(&self, run_id: &str) -> StoreResult<Vec<StepResult>> {
        let rows = sqlx::query(&format!(
            "SELECT name, attempts, duration_secs, status, error FROM {STEPS_TABLE}
             WHERE run_id = ? ORDER BY position"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<StepResult> {
                let attempts: i64 = row.try_get("attempts")?;
                let duration_secs: f64 = row.try_get("duration_secs")?;
                let status: String = row.try_get("status")?;
                Ok(StepResult {
                    name: row.try_get("name")?,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                    duration: Duration::from_secs_f64(duration_secs.max(0.0)),
                    status: parse_status(STEPS_TABLE, &status)?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }
}

fn parse_status(table: &str, raw: &str) -> StoreResult<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| StoreError::Corrupt {
        table: table.to_string(),
        reason: format!("status {raw:?}"),
    })
}
