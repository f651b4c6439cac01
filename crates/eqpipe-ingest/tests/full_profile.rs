use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use eqpipe_core::{RunStatus, StatementKind};
use eqpipe_flow::spawn_pipeline;
use eqpipe_ingest::{PipelineConfig, PipelineContext, Profile};
use eqpipe_store::{audit_entries_for, load_symbols, RunStore, STATIC_TABLE};
use serde_json::json;

fn write_json(path: &Path, value: serde_json::Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn seed_fixtures(root: &Path) {
    write_json(
        &root.join("universe.json"),
        json!([
            {"symbol": "TCS", "name_of_company": "Tata Consultancy Services", "series": "EQ",
             "date_of_listing": "25-AUG-2004", "isin_number": "INE467B01029", "face_value": 1.0},
            {"symbol": "INFY", "name_of_company": "Infosys", "series": "EQ",
             "date_of_listing": "08-FEB-1995", "isin_number": "INE009A01021", "face_value": 5.0}
        ]),
    );
    write_json(
        &root.join("info/TCS.json"),
        json!({"symbol": "TCS.NS", "sector": "Technology", "city": "Mumbai", "currentPrice": 3520.5}),
    );
    for kind in StatementKind::ALL {
        write_json(
            &root.join(format!("statements/TCS/{}.json", kind.slug())),
            json!([
                {"metric_name": "Total", "period": "2024-03-31 00:00:00", "value": 10.0},
                {"metric_name": "Total", "period": "2023-03-31 00:00:00", "value": 9.0}
            ]),
        );
    }
}

fn config_for(dir: &Path) -> PipelineConfig {
    let vars: HashMap<&str, String> = [
        ("DATABASE_URL", format!("sqlite://{}", dir.join("db/pipeline.db").display())),
        ("EQP_FIXTURES_DIR", dir.join("fixtures").display().to_string()),
        ("EQP_WORKSPACE_ROOT", dir.display().to_string()),
        ("EQP_MIN_UNIVERSE_ROWS", "1".to_string()),
        ("EQP_FETCH_RETRIES", "1".to_string()),
    ]
    .into_iter()
    .collect();
    PipelineConfig::from_lookup(|key| vars.get(key).cloned())
}

#[tokio::test]
async fn full_profile_populates_every_table_and_records_the_run() {
    let dir = tempfile::tempdir().unwrap();
    seed_fixtures(&dir.path().join("fixtures"));

    let ctx = Arc::new(PipelineContext::from_config(config_for(dir.path())).await.unwrap());
    let mut handle = spawn_pipeline(ctx.orchestrator(), Profile::Full.steps(&ctx));
    let mut events = 0;
    while handle.events.recv().await.is_some() {
        events += 1;
    }
    let run = handle.join().await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.steps.len(), 3);
    assert!(run.steps.iter().all(|s| s.attempts == 1));
    assert_eq!(events, 6);

    assert_eq!(load_symbols(&ctx.pool).await.unwrap(), vec!["INFY", "TCS"]);
    let sector: String = sqlx::query_scalar(&format!("SELECT sector FROM {STATIC_TABLE} WHERE symbol = 'TCS'"))
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(sector, "Technology");

    // INFY has no info fixture and no statements: audited, not fatal.
    let infy = audit_entries_for(&ctx.pool, "INFY").await.unwrap();
    assert_eq!(infy.len(), 4);

    let history = RunStore::new(ctx.pool.clone()).recent_runs(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, run.id);
    assert_eq!(history[0].steps[2].name, "Equity Statements");
}

#[tokio::test]
async fn info_profile_on_empty_universe_succeeds_without_work() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();

    let ctx = Arc::new(PipelineContext::from_config(config_for(dir.path())).await.unwrap());
    let mut orchestrator = ctx.orchestrator();
    let run = orchestrator
        .execute(&Profile::Info.steps(&ctx), &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn missing_universe_file_fails_the_run_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
    let ctx = Arc::new(PipelineContext::from_config(config_for(dir.path())).await.unwrap());
    let mut orchestrator = eqpipe_flow::Orchestrator::new(
        eqpipe_flow::RetryPolicy::new(2, 2.0).with_unit(std::time::Duration::from_millis(1)),
        Arc::new(RunStore::new(ctx.pool.clone())),
    );
    let run = orchestrator
        .execute(&Profile::Full.steps(&ctx), &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].attempts, 2);
    assert!(run.steps[0].error.as_deref().unwrap().contains("fetching equity universe"));
}
