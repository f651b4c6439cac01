//! Process configuration read from the environment, and the settings derived from it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use eqpipe_flow::RetryPolicy;
use eqpipe_sources::BackoffPolicy;

use crate::classify::DEFAULT_MAX_VOLATILE_FIELDS;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/equity_pipeline.db";
pub const DEFAULT_SOURCE_NAME: &str = "Yahoo Finance";

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub fixtures_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub step_retries: u32,
    pub step_backoff: f64,
    pub fetch_retries: u32,
    pub fetch_pace: Duration,
    pub commit_batch_size: usize,
    pub max_dynamic_columns: usize,
    pub source_name: String,
    pub universe_source_name: String,
    pub min_universe_rows: usize,
    pub fiscal_year_end_month: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset or unparsable keys
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        let lookup = &lookup;
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            fixtures_dir: lookup("EQP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            workspace_root: lookup("EQP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            step_retries: parsed(lookup, "EQP_STEP_RETRIES").unwrap_or(3),
            step_backoff: parsed(lookup, "EQP_STEP_BACKOFF")
                .filter(|b: &f64| b.is_finite() && *b >= 1.0)
                .unwrap_or(2.0),
            fetch_retries: parsed(lookup, "EQP_FETCH_RETRIES").unwrap_or(3),
            fetch_pace: Duration::from_millis(parsed(lookup, "EQP_FETCH_PACE_MS").unwrap_or(0)),
            commit_batch_size: parsed(lookup, "EQP_COMMIT_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(20),
            max_dynamic_columns: parsed(lookup, "EQP_MAX_DYNAMIC_COLUMNS").unwrap_or(DEFAULT_MAX_VOLATILE_FIELDS),
            source_name: lookup("EQP_SOURCE_NAME").unwrap_or_else(|| DEFAULT_SOURCE_NAME.to_string()),
            universe_source_name: lookup("EQP_UNIVERSE_SOURCE_NAME").unwrap_or_else(|| "NSE".to_string()),
            min_universe_rows: parsed(lookup, "EQP_MIN_UNIVERSE_ROWS").unwrap_or(1000),
            fiscal_year_end_month: parsed(lookup, "EQP_FISCAL_YEAR_END_MONTH")
                .filter(|m: &u32| (1..=12).contains(m))
                .unwrap_or(3),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.step_retries, self.step_backoff)
    }

    pub fn fetch_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.fetch_retries.max(1),
            ..BackoffPolicy::default()
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            source_name: self.source_name.clone(),
            commit_batch_size: self.commit_batch_size,
            fiscal_year_end_month: self.fiscal_year_end_month,
        }
    }

    pub fn universe_settings(&self) -> UniverseSettings {
        UniverseSettings {
            source_name: self.universe_source_name.clone(),
            min_rows: self.min_universe_rows,
        }
    }
}

/// Knobs shared by the info and statement ingestors.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub source_name: String,
    pub commit_batch_size: usize,
    pub fiscal_year_end_month: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        PipelineConfig::default().ingest_settings()
    }
}

#[derive(Debug, Clone)]
pub struct UniverseSettings {
    pub source_name: String,
    pub min_rows: usize,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        PipelineConfig::default().universe_settings()
    }
}
