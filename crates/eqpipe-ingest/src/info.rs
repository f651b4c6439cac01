//! Descriptive equity info: one stable row per symbol, one dated volatile row
//! per symbol and day.

use std::time::Instant;

use chrono::Utc;
use eqpipe_core::{AuditEntry, ClassifiedRecord, ColumnMap, ColumnValue, EntityPayload, AUDIT_ALL_TABLES};
use eqpipe_sources::InfoFetcher;
use eqpipe_store::{
    append_audit, ensure_columns, format_ts, table_columns, upsert, DYNAMIC_TABLE, STATIC_TABLE,
};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{FieldClassifier, RESERVED_COLUMNS};
use crate::config::IngestSettings;
use crate::{EntityError, IngestError, IngestSummary};

pub const INFO_STAGE: &str = "info";

const STATIC_KEY: [&str; 1] = ["symbol"];
const DYNAMIC_KEY: [&str; 2] = ["symbol", "as_of_date"];

pub struct InfoIngestor {
    pool: SqlitePool,
    classifier: FieldClassifier,
    settings: IngestSettings,
}

struct Stamp {
    as_of_date: String,
    ingested_at: String,
}

impl InfoIngestor {
    pub fn new(pool: SqlitePool, classifier: FieldClassifier, settings: IngestSettings) -> Self {
        Self {
            pool,
            classifier,
            settings,
        }
    }

    /// Fetches and stores every symbol in order.
    ///
    /// Each entity is written inside its own savepoint, so a rejected entity
    /// leaves no partial rows. Work is committed every `commit_batch_size`
    /// entities. Cancellation is checked between entities; when it fires the
    /// finished work is committed and `IngestError::Interrupted` is returned.
    pub async fn ingest_all(
        &self,
        symbols: &[String],
        fetcher: &dyn InfoFetcher,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let started = Instant::now();
        let now = Utc::now();
        let stamp = Stamp {
            as_of_date: now.date_naive().format("%Y-%m-%d").to_string(),
            ingested_at: format_ts(now),
        };
        let batch_size = self.settings.commit_batch_size.max(1);
        let total = symbols.len();
        let mut summary = IngestSummary::default();

        let mut tx = self.pool.begin().await?;
        let mut pending = 0usize;
        for (position, symbol) in symbols.iter().enumerate() {
            if cancel.is_cancelled() {
                tx.commit().await?;
                summary.elapsed = started.elapsed();
                warn!(
                    stage = INFO_STAGE,
                    processed = summary.processed(),
                    total,
                    "interrupted; committed progress"
                );
                return Err(IngestError::Interrupted { summary, total });
            }

            info!(stage = INFO_STAGE, symbol = %symbol, position = position + 1, total, "processing");
            let outcome = match fetcher.fetch_info(symbol).await {
                Ok(payload) => self.write_entity(&mut tx, symbol, &payload, &stamp).await,
                Err(err) => Err(EntityError::from(err)),
            };
            match outcome {
                Ok(()) => summary.succeeded += 1,
                Err(reason) => {
                    warn!(stage = INFO_STAGE, symbol = %symbol, error = %reason, "entity failed");
                    append_audit(&mut tx, &AuditEntry::failure(INFO_STAGE, symbol, AUDIT_ALL_TABLES, &reason))
                        .await?;
                    summary.failed += 1;
                }
            }

            pending += 1;
            if pending >= batch_size {
                tx.commit().await?;
                debug!(stage = INFO_STAGE, entities = pending, "batch committed");
                tx = self.pool.begin().await?;
                pending = 0;
            }
        }
        tx.commit().await?;

        summary.elapsed = started.elapsed();
        info!(
            stage = INFO_STAGE,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "info ingestion finished"
        );
        Ok(summary)
    }

    async fn write_entity(
        &self,
        conn: &mut SqliteConnection,
        symbol: &str,
        payload: &EntityPayload,
        stamp: &Stamp,
    ) -> Result<(), EntityError> {
        let record = self.classifier.classify(payload)?;

        let mut savepoint = conn.begin().await?;
        match self.apply_record(&mut savepoint, symbol, record, stamp).await {
            Ok(()) => Ok(savepoint.commit().await?),
            Err(err) => {
                savepoint.rollback().await?;
                Err(err)
            }
        }
    }

    async fn apply_record(
        &self,
        conn: &mut SqliteConnection,
        symbol: &str,
        record: ClassifiedRecord,
        stamp: &Stamp,
    ) -> Result<(), EntityError> {
        let overflow = record.overflow_payload();
        let mut static_row = self.base_row(symbol, stamp);
        static_row.extend(record.stable);

        let mut dynamic_row = self.base_row(symbol, stamp);
        dynamic_row.insert("as_of_date".into(), ColumnValue::text(&stamp.as_of_date));
        match overflow {
            Some(extra) => {
                // A row carries either overflow or volatile columns, never both.
                for column in table_columns(conn, DYNAMIC_TABLE).await? {
                    if !RESERVED_COLUMNS.contains(&column.as_str()) {
                        dynamic_row.insert(column, ColumnValue::Null);
                    }
                }
                dynamic_row.insert("extra_payload".into(), ColumnValue::Text(extra));
            }
            None => {
                dynamic_row.extend(record.volatile);
                dynamic_row.insert("extra_payload".into(), ColumnValue::Null);
            }
        }

        ensure_columns(conn, STATIC_TABLE, static_row.keys().map(String::as_str)).await?;
        ensure_columns(conn, DYNAMIC_TABLE, dynamic_row.keys().map(String::as_str)).await?;

        upsert(conn, STATIC_TABLE, &static_row, &STATIC_KEY).await?;
        append_audit(conn, &AuditEntry::success(INFO_STAGE, symbol, STATIC_TABLE, static_row.len())).await?;
        upsert(conn, DYNAMIC_TABLE, &dynamic_row, &DYNAMIC_KEY).await?;
        append_audit(conn, &AuditEntry::success(INFO_STAGE, symbol, DYNAMIC_TABLE, dynamic_row.len())).await?;
        Ok(())
    }

    fn base_row(&self, symbol: &str, stamp: &Stamp) -> ColumnMap {
        ColumnMap::from([
            ("symbol".to_string(), ColumnValue::text(symbol)),
            ("source".to_string(), ColumnValue::text(&self.settings.source_name)),
            ("ingested_at".to_string(), ColumnValue::text(&stamp.ingested_at)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{symbols, temp_pool, CannedSource};
    use eqpipe_core::AuditStatus;
    use eqpipe_store::audit_entries_for;
    use serde_json::{json, Map, Value as JsonValue};
    use sqlx::Row;

    fn settings(batch: usize) -> IngestSettings {
        IngestSettings {
            commit_batch_size: batch,
            ..IngestSettings::default()
        }
    }

    fn ingestor(pool: &SqlitePool) -> InfoIngestor {
        InfoIngestor::new(pool.clone(), FieldClassifier::default(), settings(20))
    }

    fn wide_payload(volatile: usize) -> JsonValue {
        let mut fields = Map::new();
        fields.insert("symbol".into(), json!("TCS.NS"));
        fields.insert("sector".into(), json!("Technology"));
        for i in 0..volatile {
            fields.insert(format!("metric{i}"), json!(i as f64 + 0.5));
        }
        JsonValue::Object(fields)
    }

    async fn columns(pool: &SqlitePool, table: &str) -> Vec<String> {
        let mut conn = pool.acquire().await.unwrap();
        table_columns(&mut conn, table).await.unwrap()
    }

    #[tokio::test]
    async fn stores_stable_and_volatile_rows_with_audit() {
        let (_dir, pool) = temp_pool().await;
        let source = CannedSource::default().with_info(
            "TCS",
            json!({"symbol": "TCS.NS", "sector": "Technology", "currentPrice": 3520.5, "52WeekChange": 0.12}),
        );

        let summary = ingestor(&pool)
            .ingest_all(&symbols(&["TCS"]), &source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.succeeded, summary.failed), (1, 0));

        let row = sqlx::query(&format!("SELECT sector, src_symbol, source FROM {STATIC_TABLE} WHERE symbol = 'TCS'"))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("sector"), "Technology");
        assert_eq!(row.get::<String, _>("src_symbol"), "TCS.NS");
        assert_eq!(row.get::<String, _>("source"), "Yahoo Finance");

        let dynamic = columns(&pool, DYNAMIC_TABLE).await;
        assert!(dynamic.contains(&"currentprice".to_string()));
        assert!(dynamic.contains(&"f_52weekchange".to_string()));

        let audit = audit_entries_for(&pool, "TCS").await.unwrap();
        let tables: Vec<_> = audit.iter().map(|e| e.table_name.as_str()).collect();
        assert_eq!(tables, vec![STATIC_TABLE, DYNAMIC_TABLE]);
        assert!(audit.iter().all(|e| e.status == AuditStatus::Success));
    }

    #[tokio::test]
    async fn wide_payload_goes_to_overflow_narrow_to_columns() {
        let (_dir, pool) = temp_pool().await;
        let source = CannedSource::default()
            .with_info("WIDE", wide_payload(400))
            .with_info("NARROW", wide_payload(50));

        ingestor(&pool)
            .ingest_all(&symbols(&["WIDE"]), &source, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!columns(&pool, DYNAMIC_TABLE).await.contains(&"metric0".to_string()));
        let extra: Option<String> = sqlx::query_scalar(&format!(
            "SELECT extra_payload FROM {DYNAMIC_TABLE} WHERE symbol = 'WIDE'"
        ))
        .fetch_one(&pool)
        .await
        .unwrap();
        let extra: serde_json::Value = serde_json::from_str(&extra.unwrap()).unwrap();
        assert_eq!(extra.as_object().unwrap().len(), 400);

        ingestor(&pool)
            .ingest_all(&symbols(&["NARROW"]), &source, &CancellationToken::new())
            .await
            .unwrap();
        let dynamic = columns(&pool, DYNAMIC_TABLE).await;
        assert!(dynamic.contains(&"metric49".to_string()));
        assert!(!dynamic.contains(&"metric50".to_string()));
        let row = sqlx::query(&format!(
            "SELECT metric49, extra_payload FROM {DYNAMIC_TABLE} WHERE symbol = 'NARROW'"
        ))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<String, _>("metric49"), "49.5");
        assert!(row.get::<Option<String>, _>("extra_payload").is_none());
    }

    #[tokio::test]
    async fn overflow_clears_volatile_columns_on_same_day_rewrite() {
        let (_dir, pool) = temp_pool().await;
        let narrow = CannedSource::default().with_info("TCS", wide_payload(50));
        let wide = CannedSource::default().with_info("TCS", wide_payload(400));

        ingestor(&pool)
            .ingest_all(&symbols(&["TCS"]), &narrow, &CancellationToken::new())
            .await
            .unwrap();
        ingestor(&pool)
            .ingest_all(&symbols(&["TCS"]), &wide, &CancellationToken::new())
            .await
            .unwrap();

        let row = sqlx::query(&format!(
            "SELECT metric0, extra_payload FROM {DYNAMIC_TABLE} WHERE symbol = 'TCS'"
        ))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(row.get::<Option<String>, _>("metric0").is_none());
        assert!(row.get::<Option<String>, _>("extra_payload").is_some());

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {DYNAMIC_TABLE}"))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn failed_entities_are_isolated_and_audited() {
        let (_dir, pool) = temp_pool().await;
        let source = CannedSource::default()
            .with_info("TCS", json!({"symbol": "TCS.NS", "city": "Mumbai"}))
            .with_info("BAD", json!({"a-b": 1, "a_b": 2}))
            .with_info("INFY", json!({"symbol": "INFY.NS", "city": "Bengaluru"}));

        let summary = ingestor(&pool)
            .ingest_all(&symbols(&["TCS", "MISSING", "BAD", "INFY"]), &source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.succeeded, summary.failed), (2, 2));

        let stored: Vec<String> = sqlx::query_scalar(&format!("SELECT symbol FROM {STATIC_TABLE} ORDER BY symbol"))
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(stored, vec!["INFY", "TCS"]);

        for symbol in ["MISSING", "BAD"] {
            let audit = audit_entries_for(&pool, symbol).await.unwrap();
            assert_eq!(audit.len(), 1);
            assert_eq!(audit[0].table_name, AUDIT_ALL_TABLES);
            assert_eq!(audit[0].status, AuditStatus::Failed);
            assert_eq!(audit[0].item_count, 0);
            assert!(audit[0].error.is_some());
        }
    }

    #[tokio::test]
    async fn rejected_write_leaves_no_partial_rows_or_columns() {
        let (_dir, pool) = temp_pool().await;
        sqlx::query(&format!("DROP TABLE {DYNAMIC_TABLE}"))
            .execute(&pool)
            .await
            .unwrap();
        let source = CannedSource::default().with_info("TCS", json!({"symbol": "TCS.NS", "sector": "IT"}));

        let summary = ingestor(&pool)
            .ingest_all(&symbols(&["TCS"]), &source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {STATIC_TABLE}"))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(!columns(&pool, STATIC_TABLE).await.contains(&"sector".to_string()));

        let audit = audit_entries_for(&pool, "TCS").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_between_entities_commits_applied_work() {
        let (_dir, pool) = temp_pool().await;
        let cancel = CancellationToken::new();
        let source = CannedSource::default()
            .with_info("A", json!({"symbol": "A.NS"}))
            .with_info("B", json!({"symbol": "B.NS"}))
            .with_info("C", json!({"symbol": "C.NS"}))
            .cancelling_on("B", cancel.clone());

        let err = ingestor(&pool)
            .ingest_all(&symbols(&["A", "B", "C"]), &source, &cancel)
            .await
            .unwrap_err();
        match err {
            IngestError::Interrupted { summary, total } => {
                assert_eq!(summary.succeeded, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let stored: Vec<String> = sqlx::query_scalar(&format!("SELECT symbol FROM {STATIC_TABLE} ORDER BY symbol"))
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(stored, vec!["A", "B"]);
    }

    /// Drops the audit table right before serving `symbol`, so writing that
    /// entity and recording its failure both hit a missing table.
    struct LosesAuditLogOn {
        inner: CannedSource,
        pool: SqlitePool,
        symbol: &'static str,
    }

    #[async_trait::async_trait]
    impl InfoFetcher for LosesAuditLogOn {
        async fn fetch_info(&self, symbol: &str) -> Result<EntityPayload, eqpipe_sources::FetchError> {
            if symbol == self.symbol {
                sqlx::query(&format!("DROP TABLE {}", eqpipe_store::AUDIT_TABLE))
                    .execute(&self.pool)
                    .await
                    .unwrap();
            }
            self.inner.fetch_info(symbol).await
        }
    }

    #[tokio::test]
    async fn committed_batches_survive_a_later_fatal_error() {
        let (_dir, pool) = temp_pool().await;
        let mut inner = CannedSource::default();
        for symbol in ["A", "B", "C", "D", "E"] {
            inner = inner.with_info(symbol, json!({"symbol": format!("{symbol}.NS"), "city": "Mumbai"}));
        }
        let fetcher = LosesAuditLogOn {
            inner,
            pool: pool.clone(),
            symbol: "E",
        };

        let err = InfoIngestor::new(pool.clone(), FieldClassifier::default(), settings(2))
            .ingest_all(&symbols(&["A", "B", "C", "D", "E"]), &fetcher, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));

        let stored: Vec<String> = sqlx::query_scalar(&format!("SELECT symbol FROM {STATIC_TABLE} ORDER BY symbol"))
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(stored, vec!["A", "B", "C", "D"]);
        let dated: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {DYNAMIC_TABLE}"))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(dated, 4);
    }

    #[tokio::test]
    async fn reingesting_identical_payload_keeps_one_row() {
        let (_dir, pool) = temp_pool().await;
        let source = CannedSource::default().with_info("TCS", json!({"symbol": "TCS.NS", "city": "Mumbai"}));
        for _ in 0..2 {
            ingestor(&pool)
                .ingest_all(&symbols(&["TCS"]), &source, &CancellationToken::new())
                .await
                .unwrap();
        }
        let cities: Vec<String> = sqlx::query_scalar(&format!("SELECT city FROM {STATIC_TABLE}"))
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(cities, vec!["Mumbai"]);
    }
}
