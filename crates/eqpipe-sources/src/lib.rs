//! Fetch collaborator contracts plus a fixture-file source and a retrying wrapper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use eqpipe_core::{EntityPayload, StatementCell, StatementKind, UniverseRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "eqpipe-sources";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source unavailable for {entity}: {reason}")]
    Unavailable { entity: String, reason: String },
    #[error("invalid payload for {entity}: {reason}")]
    InvalidPayload { entity: String, reason: String },
    #[error("no data for {entity}")]
    NotFound { entity: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_fetch_error(err: &FetchError) -> RetryDisposition {
    match err {
        FetchError::Unavailable { .. } | FetchError::InvalidPayload { .. } => RetryDisposition::Retryable,
        FetchError::NotFound { .. } | FetchError::Io { .. } | FetchError::Parse { .. } => {
            RetryDisposition::NonRetryable
        }
    }
}

/// Supplies the raw attribute payload for one symbol.
#[async_trait]
pub trait InfoFetcher: Send + Sync {
    async fn fetch_info(&self, symbol: &str) -> Result<EntityPayload, FetchError>;
}

/// Supplies the reported cells of one financial statement for one symbol.
#[async_trait]
pub trait StatementFetcher: Send + Sync {
    async fn fetch_statement(
        &self,
        symbol: &str,
        kind: StatementKind,
    ) -> Result<Vec<StatementCell>, FetchError>;
}

/// Supplies the full listed-equity universe snapshot.
#[async_trait]
pub trait UniverseFetcher: Send + Sync {
    async fn fetch_universe(&self) -> Result<Vec<UniverseRecord>, FetchError>;
}

/// Rejects empty payloads and payloads that do not identify their symbol.
pub fn validate_info_payload(payload: &EntityPayload) -> Result<(), FetchError> {
    let invalid = |reason: &str| FetchError::InvalidPayload {
        entity: payload.entity_id.clone(),
        reason: reason.to_string(),
    };
    if payload.is_empty() {
        return Err(invalid("empty payload"));
    }
    match payload.fields.get("symbol") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(()),
        Some(_) => Err(invalid("symbol field is not a non-empty string")),
        None => Err(invalid("symbol field missing")),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given 1-based failed attempt: base, 2x base, 4x base, ... capped.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Enforces a minimum spacing between consecutive upstream requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Wraps a fetcher with bounded retries, payload validation and pacing.
///
/// Retrying is the fetch collaborator's concern; the ingestion engine treats
/// whatever error finally surfaces here as terminal for that entity.
pub struct RetryingFetcher<F> {
    inner: F,
    backoff: BackoffPolicy,
    pacer: Option<RequestPacer>,
}

impl<F> RetryingFetcher<F> {
    pub fn new(inner: F, backoff: BackoffPolicy) -> Self {
        Self {
            inner,
            backoff,
            pacer: None,
        }
    }

    pub fn with_pacing(mut self, min_interval: Duration) -> Self {
        if !min_interval.is_zero() {
            self.pacer = Some(RequestPacer::new(min_interval));
        }
        self
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    async fn retry<T, Fut>(&self, entity: &str, mut call: impl FnMut() -> Fut) -> Result<T, FetchError>
    where
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = classify_fetch_error(&err) == RetryDisposition::Retryable;
                    warn!(entity, attempt, max_attempts, error = %err, "fetch failed");
                    if !retryable || attempt >= max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.backoff.delay_after_attempt(attempt)).await;
                }
            }
        }
    }
}

#[async_trait]
impl<F: InfoFetcher> InfoFetcher for RetryingFetcher<F> {
    async fn fetch_info(&self, symbol: &str) -> Result<EntityPayload, FetchError> {
        let span = info_span!("fetch_info", symbol);
        self.retry(symbol, || async {
            let payload = self.inner.fetch_info(symbol).await?;
            validate_info_payload(&payload)?;
            Ok(payload)
        })
        .instrument(span)
        .await
    }
}

#[async_trait]
impl<F: StatementFetcher> StatementFetcher for RetryingFetcher<F> {
    async fn fetch_statement(
        &self,
        symbol: &str,
        kind: StatementKind,
    ) -> Result<Vec<StatementCell>, FetchError> {
        let span = info_span!("fetch_statement", symbol, statement = kind.slug());
        self.retry(symbol, || self.inner.fetch_statement(symbol, kind))
            .instrument(span)
            .await
    }
}

#[async_trait]
impl<F: UniverseFetcher> UniverseFetcher for RetryingFetcher<F> {
    async fn fetch_universe(&self) -> Result<Vec<UniverseRecord>, FetchError> {
        self.retry("universe", || self.inner.fetch_universe())
            .instrument(info_span!("fetch_universe"))
            .await
    }
}

/// Fixture-first source reading captured payloads from a directory tree:
///
/// ```text
/// <root>/universe.json
/// <root>/info/<SYMBOL>.json
/// <root>/statements/<SYMBOL>/<statement>.json
/// ```
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        entity: &str,
        path: PathBuf,
    ) -> Result<T, FetchError> {
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    entity: entity.to_string(),
                })
            }
            Err(source) => {
                return Err(FetchError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| FetchError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl InfoFetcher for FixtureSource {
    async fn fetch_info(&self, symbol: &str) -> Result<EntityPayload, FetchError> {
        let path = self.root.join("info").join(format!("{symbol}.json"));
        let fields: BTreeMap<String, JsonValue> = self.read_json(symbol, path).await?;
        Ok(EntityPayload::new(symbol, fields))
    }
}

#[async_trait]
impl StatementFetcher for FixtureSource {
    async fn fetch_statement(
        &self,
        symbol: &str,
        kind: StatementKind,
    ) -> Result<Vec<StatementCell>, FetchError> {
        let path = self
            .root
            .join("statements")
            .join(symbol)
            .join(format!("{}.json", kind.slug()));
        self.read_json(symbol, path).await
    }
}

#[async_trait]
impl UniverseFetcher for FixtureSource {
    async fn fetch_universe(&self) -> Result<Vec<UniverseRecord>, FetchError> {
        self.read_json("universe", self.root.join("universe.json")).await
    }
}
