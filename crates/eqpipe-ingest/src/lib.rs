//! Ingestion stages of the equity pipeline and the profiles that chain them.

pub mod classify;
pub mod config;
pub mod info;
pub mod profiles;
pub mod statements;
pub mod universe;

use std::time::Duration;

use eqpipe_sources::FetchError;
use eqpipe_store::StoreError;
use thiserror::Error;

pub use classify::{normalize_field_name, ClassifyError, FieldClassifier};
pub use config::{IngestSettings, PipelineConfig, UniverseSettings};
pub use info::InfoIngestor;
pub use profiles::{PipelineContext, Profile};
pub use statements::StatementIngestor;
pub use universe::{refresh_universe, UniverseError};

pub const CRATE_NAME: &str = "eqpipe-ingest";

/// Per-call entity counts. Failed entities are recorded, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl IngestSummary {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion interrupted after {} of {total} entities", .summary.processed())]
    Interrupted { summary: IngestSummary, total: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Why a single entity could not be written. Always recovered from.
#[derive(Debug, Error)]
pub(crate) enum EntityError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for EntityError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}
