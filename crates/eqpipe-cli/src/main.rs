use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eqpipe_core::{Run, RunStatus};
use eqpipe_flow::{spawn_pipeline, FlowError, StepEvent};
use eqpipe_ingest::{PipelineConfig, PipelineContext, Profile};
use eqpipe_store::RunStore;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "eqpipe")]
#[command(about = "Equity data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a pipeline profile: universe, info, statements or full.
    Run {
        #[arg(long, default_value = "full")]
        profile: Profile,
    },
    /// Create the store's tables.
    Migrate,
    /// Show recent runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { profile: Profile::Full }) {
        Commands::Run { profile } => run_profile(config, profile).await?,
        Commands::Migrate => {
            let pool = eqpipe_store::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            eqpipe_store::bootstrap(&pool).await.context("bootstrapping store")?;
            println!("store ready: {}", config.database_url);
        }
        Commands::Runs { limit } => {
            let pool = eqpipe_store::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            eqpipe_store::bootstrap(&pool).await.context("bootstrapping store")?;
            for run in RunStore::new(pool).recent_runs(limit).await? {
                print_run(&run);
            }
        }
    }

    Ok(())
}

async fn run_profile(config: PipelineConfig, profile: Profile) -> Result<()> {
    let ctx = Arc::new(PipelineContext::from_config(config).await?);
    let mut handle = spawn_pipeline(ctx.orchestrator(), profile.steps(&ctx));

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested; stopping after the current entity");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.events.recv().await {
        print_event(&event);
    }

    let run = match handle.join().await {
        Ok(run) => run,
        Err(FlowError::Persist { run, cause }) => {
            eprintln!("warning: run history not saved: {cause:#}");
            *run
        }
        Err(err) => return Err(err.into()),
    };
    print_run(&run);

    if run.status != RunStatus::Success {
        bail!("profile {profile} finished as {}", run.status);
    }
    Ok(())
}

fn print_event(event: &StepEvent) {
    match event {
        StepEvent::Started { step, attempt } => println!("[{step}] attempt {attempt} started"),
        StepEvent::Failed {
            step,
            attempt,
            elapsed,
            error,
            retry_in,
        } => match retry_in {
            Some(delay) => println!(
                "[{step}] attempt {attempt} failed after {:.1}s: {error}; retrying in {:.1}s",
                elapsed.as_secs_f64(),
                delay.as_secs_f64()
            ),
            None => println!(
                "[{step}] attempt {attempt} failed after {:.1}s: {error}",
                elapsed.as_secs_f64()
            ),
        },
        StepEvent::Succeeded {
            step,
            attempts,
            elapsed,
        } => println!(
            "[{step}] succeeded after {attempts} attempt(s) in {:.1}s",
            elapsed.as_secs_f64()
        ),
    }
}

fn print_run(run: &Run) {
    let total = run
        .total_duration()
        .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "run {} {} started={} total={total}",
        run.id,
        run.status,
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    for step in &run.steps {
        println!(
            "  {:<20} {:<9} attempts={} duration={:.1}s{}",
            step.name,
            step.status.as_str(),
            step.attempts,
            step.duration.as_secs_f64(),
            step.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default()
        );
    }
}
