//! Pipeline orchestration: ordered steps, retry-aware execution, run history.

mod runner;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use eqpipe_core::{Run, RunStatus, StepResult};
use eqpipe_store::RunStore;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use runner::{run_step, RetryPolicy, StepError, StepOutcome};

pub const CRATE_NAME: &str = "eqpipe-flow";

pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type StepFn = dyn Fn(CancellationToken) -> StepFuture + Send + Sync;

/// A named, re-invocable unit of work. Each attempt receives the run's
/// cancellation token so long-running work can stop between items.
#[derive(Clone)]
pub struct Step {
    name: String,
    work: Arc<StepFn>,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Arc::new(move |cancel| -> StepFuture { Box::pin(work(cancel)) }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, cancel: CancellationToken) -> StepFuture {
        (self.work)(cancel)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Step lifecycle notification. Advisory only: sinks never influence control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Started {
        step: String,
        attempt: u32,
    },
    Failed {
        step: String,
        attempt: u32,
        elapsed: Duration,
        error: String,
        retry_in: Option<Duration>,
    },
    Succeeded {
        step: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl StepEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "start",
            Self::Failed { .. } => "failure",
            Self::Succeeded { .. } => "success",
        }
    }

    pub fn step(&self) -> &str {
        match self {
            Self::Started { step, .. } | Self::Failed { step, .. } | Self::Succeeded { step, .. } => step,
        }
    }
}

/// Receives step events. Implementations must not block. A panicking sink is
/// caught and logged; it never interrupts the run.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StepEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: StepEvent) {}
}

/// Forwards events to another task; a closed receiver drops them silently.
impl EventSink for mpsc::UnboundedSender<StepEvent> {
    fn emit(&self, event: StepEvent) {
        let _ = self.send(event);
    }
}

/// Adapts a closure into an [`EventSink`].
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(StepEvent) + Send + Sync,
{
    fn emit(&self, event: StepEvent) {
        (self.0)(event)
    }
}

/// Persists a finished run. Called exactly once per run.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record(&self, run: &Run) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopRecorder;

#[async_trait]
impl RunRecorder for NoopRecorder {
    async fn record(&self, _run: &Run) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RunRecorder for RunStore {
    async fn record(&self, run: &Run) -> anyhow::Result<()> {
        self.record_run(run)
            .await
            .with_context(|| format!("persisting run {}", run.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl From<RunStatus> for PipelineState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => Self::Running,
            RunStatus::Success => Self::Done,
            RunStatus::Failed => Self::Failed,
            RunStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("a pipeline run is already in progress")]
    AlreadyRunning,
    #[error("run {} finished as {} but could not be persisted: {cause:#}", .run.id, .run.status)]
    Persist { run: Box<Run>, cause: anyhow::Error },
    #[error("pipeline worker stopped abnormally: {0}")]
    Worker(String),
}

/// Moves the state out of RUNNING when an `execute` future is dropped early.
struct RunningGuard<'a>(&'a mut PipelineState);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if *self.0 == PipelineState::Running {
            warn!("pipeline run abandoned before completion");
            *self.0 = PipelineState::Cancelled;
        }
    }
}

/// Runs ordered steps strictly one after another and records the outcome.
pub struct Orchestrator {
    policy: RetryPolicy,
    recorder: Arc<dyn RunRecorder>,
    sink: Arc<dyn EventSink>,
    state: PipelineState,
}

impl Orchestrator {
    pub fn new(policy: RetryPolicy, recorder: Arc<dyn RunRecorder>) -> Self {
        Self {
            policy,
            recorder,
            sink: Arc::new(NoopSink),
            state: PipelineState::Idle,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `steps` in order. A failed step halts the run as FAILED, a
    /// cancellation halts it as CANCELLED; later steps never start. The run is
    /// persisted once it is terminal.
    pub async fn execute(&mut self, steps: &[Step], cancel: &CancellationToken) -> Result<Run, FlowError> {
        if self.state == PipelineState::Running {
            return Err(FlowError::AlreadyRunning);
        }
        self.state = PipelineState::Running;
        let state = RunningGuard(&mut self.state);

        let mut run = Run::start();
        info!(run_id = %run.id, steps = steps.len(), "pipeline run started");

        let mut status = RunStatus::Success;
        for step in steps {
            if cancel.is_cancelled() {
                warn!(run_id = %run.id, step = step.name(), "pipeline cancelled before step");
                status = RunStatus::Cancelled;
                break;
            }

            let mut result = StepResult::started(step.name());
            match run_step(step, &self.policy, self.sink.as_ref(), cancel).await {
                Ok(outcome) => {
                    result.finalize(RunStatus::Success, outcome.attempts, outcome.duration, None);
                    run.steps.push(result);
                }
                Err(err) => {
                    status = match err {
                        StepError::Failed { .. } => RunStatus::Failed,
                        StepError::Cancelled { .. } => RunStatus::Cancelled,
                    };
                    error!(run_id = %run.id, step = step.name(), error = %err, "pipeline halted");
                    result.finalize(status, err.attempts(), err.duration(), Some(err.to_string()));
                    run.steps.push(result);
                    break;
                }
            }
        }

        run.finish(status);
        *state.0 = status.into();
        info!(
            run_id = %run.id,
            status = %run.status,
            completed = run.steps.iter().filter(|s| s.status == RunStatus::Success).count(),
            "pipeline run finished"
        );

        if let Err(cause) = self.recorder.record(&run).await {
            error!(run_id = %run.id, error = %format!("{cause:#}"), "run persistence failed");
            return Err(FlowError::Persist {
                run: Box::new(run),
                cause,
            });
        }
        Ok(run)
    }
}

/// A run executing on its own task. Events arrive on `events` until the run
/// ends; `cancel` stops it cooperatively.
pub struct PipelineHandle {
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedReceiver<StepEvent>,
    task: JoinHandle<Result<Run, FlowError>>,
}

impl PipelineHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<Run, FlowError> {
        self.task
            .await
            .map_err(|err| FlowError::Worker(err.to_string()))?
    }
}

/// Moves `orchestrator` onto a dedicated task and starts executing `steps`.
/// The orchestrator's sink is replaced by the handle's event channel.
pub fn spawn_pipeline(orchestrator: Orchestrator, steps: Vec<Step>) -> PipelineHandle {
    let (tx, events) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let mut orchestrator = orchestrator.with_sink(Arc::new(tx));
    let worker_cancel = cancel.clone();
    let task = tokio::spawn(async move { orchestrator.execute(&steps, &worker_cancel).await });
    PipelineHandle { cancel, events, task }
}
