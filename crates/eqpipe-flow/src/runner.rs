//! Single-step execution with bounded retries, exponential backoff and
//! cooperative cancellation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{EventSink, Step, StepEvent};

/// Retry ceiling and backoff schedule applied to every step of a run.
///
/// The delay after failed attempt `n` is `backoff_unit * backoff_base^(n-1)`,
/// so the first retry waits exactly one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.backoff_unit.as_secs_f64() * self.backoff_base.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub attempts: u32,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step {step} failed after {attempts} attempts: {cause:#}")]
    Failed {
        step: String,
        attempts: u32,
        duration: Duration,
        cause: anyhow::Error,
    },
    #[error("step {step} cancelled after {attempts} attempts")]
    Cancelled {
        step: String,
        attempts: u32,
        duration: Duration,
    },
}

impl StepError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Failed { duration, .. } | Self::Cancelled { duration, .. } => *duration,
        }
    }
}

fn notify(sink: &dyn EventSink, event: StepEvent) {
    let kind = event.kind();
    if catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
        warn!(event = kind, "event sink panicked; event dropped");
    }
}

/// Runs `step` until it succeeds, exhausts `policy`, or `cancel` fires.
///
/// Cancellation is checked before every attempt, after a failed attempt, and
/// throughout the backoff sleep. Every transition is logged regardless of the
/// sink, and the returned duration covers all attempts and backoff.
pub async fn run_step(
    step: &Step,
    policy: &RetryPolicy,
    sink: &dyn EventSink,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StepError> {
    let name = step.name();
    let max_attempts = policy.attempts();
    let started = Instant::now();
    let mut attempt = 0u32;

    let cancelled = |attempts: u32| StepError::Cancelled {
        step: name.to_string(),
        attempts,
        duration: started.elapsed(),
    };

    loop {
        if cancel.is_cancelled() {
            warn!(step = name, attempt = attempt + 1, "step cancelled before attempt");
            return Err(cancelled(attempt));
        }

        attempt += 1;
        info!(step = name, attempt, max_attempts, "starting step");
        notify(sink, StepEvent::Started {
            step: name.to_string(),
            attempt,
        });

        let attempt_started = Instant::now();
        let result = step.invoke(cancel.clone()).await;
        let elapsed = attempt_started.elapsed();

        let err = match result {
            Ok(()) => {
                info!(step = name, attempt, elapsed_secs = elapsed.as_secs_f64(), "step completed");
                notify(sink, StepEvent::Succeeded {
                    step: name.to_string(),
                    attempts: attempt,
                    elapsed,
                });
                return Ok(StepOutcome {
                    attempts: attempt,
                    duration: started.elapsed(),
                });
            }
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            warn!(step = name, attempt, error = %err, "step cancelled during attempt");
            return Err(cancelled(attempt));
        }

        let retry_in = (attempt < max_attempts).then(|| policy.delay_after_attempt(attempt));
        warn!(
            step = name,
            attempt,
            elapsed_secs = elapsed.as_secs_f64(),
            error = %format!("{err:#}"),
            "step attempt failed"
        );
        notify(sink, StepEvent::Failed {
            step: name.to_string(),
            attempt,
            elapsed,
            error: format!("{err:#}"),
            retry_in,
        });

        let Some(delay) = retry_in else {
            error!(step = name, attempts = attempt, "step exhausted retries");
            return Err(StepError::Failed {
                step: name.to_string(),
                attempts: attempt,
                duration: started.elapsed(),
                cause: err,
            });
        };

        info!(step = name, delay_secs = delay.as_secs_f64(), "retrying step after backoff");
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(step = name, attempt, "step cancelled during backoff");
                return Err(cancelled(attempt));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopSink;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 2.0).with_unit(Duration::from_millis(1))
    }

    fn failing_until(successful_call: Option<u32>, calls: Arc<AtomicU32>) -> Step {
        Step::new("work", move |_cancel| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                match successful_call {
                    Some(k) if call >= k => Ok(()),
                    _ => anyhow::bail!("boom on call {call}"),
                }
            }
        })
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<StepEvent>>);

    impl EventSink for RecordingSink {
        fn emit(&self, event: StepEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn delay_schedule_starts_at_one_unit() {
        let policy = RetryPolicy::new(5, 2.0);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after_attempt(200), policy.max_delay);
        assert_eq!(RetryPolicy::new(0, 2.0).attempts(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_uses_exactly_the_ceiling() {
        for retries in 1..=4 {
            let calls = Arc::new(AtomicU32::new(0));
            let step = failing_until(None, calls.clone());
            let err = run_step(&step, &fast(retries), &NoopSink, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StepError::Failed { attempts, .. } if attempts == retries));
            assert_eq!(calls.load(Ordering::SeqCst), retries);
        }
    }

    #[tokio::test]
    async fn success_on_attempt_k_reports_k() {
        for k in 1..=3 {
            let calls = Arc::new(AtomicU32::new(0));
            let step = failing_until(Some(k), calls.clone());
            let outcome = run_step(&step, &fast(3), &NoopSink, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.attempts, k);
            assert_eq!(calls.load(Ordering::SeqCst), k);
        }
    }

    #[tokio::test]
    async fn events_follow_attempt_lifecycle() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing_until(Some(2), calls);
        let sink = RecordingSink::default();
        run_step(&step, &fast(3), &sink, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<_> = sink.0.lock().unwrap().iter().map(StepEvent::kind).collect();
        assert_eq!(kinds, vec!["start", "failure", "start", "success"]);
    }

    #[tokio::test]
    async fn cancelled_token_prevents_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing_until(Some(1), calls.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_step(&step, &fast(3), &NoopSink, &cancel).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled { attempts: 0, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_promptly() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = failing_until(None, calls.clone());
        let policy = RetryPolicy::new(3, 2.0).with_unit(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run_step(&step, &policy, &NoopSink, &cancel).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled { attempts: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_after_cancel_is_reported_as_cancelled() {
        let step = Step::new("interrupted", |cancel: CancellationToken| async move {
            cancel.cancel();
            anyhow::bail!("interrupted mid-batch")
        });
        let err = run_step(&step, &fast(3), &NoopSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled { attempts: 1, .. }));
    }
}
