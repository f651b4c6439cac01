//! Named pipeline profiles and the shared context their steps run against.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use eqpipe_flow::{Orchestrator, Step};
use eqpipe_sources::{FixtureSource, InfoFetcher, RetryingFetcher, StatementFetcher, UniverseFetcher};
use eqpipe_store::{load_symbols, RunStore};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::FieldClassifier;
use crate::config::PipelineConfig;
use crate::info::InfoIngestor;
use crate::statements::StatementIngestor;
use crate::universe::refresh_universe;

pub const UNIVERSE_STEP: &str = "Equity Universe";
pub const INFO_STEP: &str = "Equity Info";
pub const STATEMENTS_STEP: &str = "Equity Statements";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Universe,
    Info,
    Statements,
    Full,
}

#[derive(Debug, Error)]
#[error("unknown profile {0:?}; expected universe, info, statements or full")]
pub struct UnknownProfile(String);

impl Profile {
    pub const ALL: [Profile; 4] = [Self::Universe, Self::Info, Self::Statements, Self::Full];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Universe => "universe",
            Self::Info => "info",
            Self::Statements => "statements",
            Self::Full => "full",
        }
    }

    pub fn step_names(self) -> &'static [&'static str] {
        match self {
            Self::Universe => &[UNIVERSE_STEP],
            Self::Info => &[INFO_STEP],
            Self::Statements => &[STATEMENTS_STEP],
            Self::Full => &[UNIVERSE_STEP, INFO_STEP, STATEMENTS_STEP],
        }
    }

    /// Builds the ordered steps for this profile.
    pub fn steps(self, ctx: &Arc<PipelineContext>) -> Vec<Step> {
        self.step_names()
            .iter()
            .map(|name| match *name {
                UNIVERSE_STEP => universe_step(ctx.clone()),
                INFO_STEP => info_step(ctx.clone()),
                _ => statements_step(ctx.clone()),
            })
            .collect()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| UnknownProfile(s.to_string()))
    }
}

/// Everything a step needs: the store, settings, classifier and fetchers.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: PipelineConfig,
    pub classifier: FieldClassifier,
    pub info: Arc<dyn InfoFetcher>,
    pub statements: Arc<dyn StatementFetcher>,
    pub universe: Arc<dyn UniverseFetcher>,
}

impl PipelineContext {
    /// Opens and bootstraps the store, loads field rules, and wires the
    /// fixture source behind retries and pacing.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let pool = eqpipe_store::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        eqpipe_store::bootstrap(&pool).await.context("bootstrapping store")?;

        let classifier = FieldClassifier::from_workspace_root(&config.workspace_root, config.max_dynamic_columns)
            .context("loading field rules")?;
        let source = Arc::new(
            RetryingFetcher::new(FixtureSource::new(&config.fixtures_dir), config.fetch_backoff())
                .with_pacing(config.fetch_pace),
        );
        info!(
            database = %config.database_url,
            fixtures = %config.fixtures_dir.display(),
            "pipeline context ready"
        );

        Ok(Self {
            pool,
            classifier,
            info: source.clone(),
            statements: source.clone(),
            universe: source,
            config,
        })
    }

    /// An orchestrator that records runs in this context's store.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.retry_policy(),
            Arc::new(RunStore::new(self.pool.clone())),
        )
    }
}

async fn symbols_or_warn(pool: &SqlitePool, step: &str) -> Result<Vec<String>> {
    let symbols = load_symbols(pool).await.context("loading equity universe")?;
    if symbols.is_empty() {
        warn!(step, "equity universe is empty; run the universe profile first");
    }
    Ok(symbols)
}

fn universe_step(ctx: Arc<PipelineContext>) -> Step {
    Step::new(UNIVERSE_STEP, move |_cancel: CancellationToken| {
        let ctx = ctx.clone();
        async move {
            let records = ctx.universe.fetch_universe().await.context("fetching equity universe")?;
            refresh_universe(&ctx.pool, records, &ctx.config.universe_settings()).await?;
            Ok(())
        }
    })
}

fn info_step(ctx: Arc<PipelineContext>) -> Step {
    Step::new(INFO_STEP, move |cancel: CancellationToken| {
        let ctx = ctx.clone();
        async move {
            let symbols = symbols_or_warn(&ctx.pool, INFO_STEP).await?;
            let ingestor = InfoIngestor::new(
                ctx.pool.clone(),
                ctx.classifier.clone(),
                ctx.config.ingest_settings(),
            );
            ingestor.ingest_all(&symbols, ctx.info.as_ref(), &cancel).await?;
            Ok(())
        }
    })
}

fn statements_step(ctx: Arc<PipelineContext>) -> Step {
    Step::new(STATEMENTS_STEP, move |cancel: CancellationToken| {
        let ctx = ctx.clone();
        async move {
            let symbols = symbols_or_warn(&ctx.pool, STATEMENTS_STEP).await?;
            let ingestor = StatementIngestor::new(ctx.pool.clone(), ctx.config.ingest_settings());
            ingestor.ingest_all(&symbols, ctx.statements.as_ref(), &cancel).await?;
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse_and_list_steps() {
        assert_eq!("Full".parse::<Profile>().unwrap(), Profile::Full);
        assert_eq!(" info ".parse::<Profile>().unwrap(), Profile::Info);
        assert!("everything".parse::<Profile>().is_err());
        assert_eq!(
            Profile::Full.step_names(),
            &[UNIVERSE_STEP, INFO_STEP, STATEMENTS_STEP]
        );
        assert_eq!(Profile::Statements.step_names(), &[STATEMENTS_STEP]);
    }
}
