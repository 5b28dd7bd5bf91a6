//! The admission loop: moves waiting cases into the limiter's active set and
//! drives each one to a terminal state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{PollBackoff, RecoveryPolicy, SchedulerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::evaluator::CaseEvaluator;
use crate::limiter::FairLimiter;
use crate::queue::{JobQueueStore, Terminal};
use crate::runner::{CaseContext, CaseLog, CaseRunner};

const TERMINAL_WRITE_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub idle_poll: Duration,
    pub recovery: RecoveryPolicy,
    pub backoff: PollBackoff,
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            idle_poll: config.scheduler.idle_poll(),
            recovery: config.scheduler.recovery,
            backoff: config.dispatcher.backoff(),
        }
    }
}

/// What one admission pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub admitted: Vec<String>,
    /// Waiting cases left in the queue because the active set is full.
    pub deferred: Vec<String>,
}

pub struct Scheduler {
    store: JobQueueStore,
    limiter: Arc<FairLimiter>,
    dispatcher: Arc<dyn Dispatcher>,
    runner: Arc<dyn CaseRunner>,
    options: SchedulerOptions,
    running: JoinSet<String>,
}

impl Scheduler {
    pub fn new(
        store: JobQueueStore,
        limiter: Arc<FairLimiter>,
        dispatcher: Arc<dyn Dispatcher>,
        runner: Arc<dyn CaseRunner>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            limiter,
            dispatcher,
            runner,
            options,
            running: JoinSet::new(),
        }
    }

    pub fn from_config(
        config: &SchedulerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        runner: Arc<dyn CaseRunner>,
    ) -> Self {
        Self::new(
            JobQueueStore::from_config(&config.queue),
            FairLimiter::new(config.limits.capacity()),
            dispatcher,
            runner,
            SchedulerOptions::from_config(config),
        )
    }

    pub fn limiter(&self) -> &Arc<FairLimiter> {
        &self.limiter
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// One admission pass over the waiting cases in FIFO order.
    ///
    /// A case is registered with the limiter and marked running before its
    /// task starts; cases past the active-set cap stay waiting.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let store = self.store.clone();
        let waiting = blocking(move || store.list_waiting()).await?;
        let mut report = TickReport::default();
        for record in waiting {
            let case_id = record.case_id;
            if let Err(err) = self.limiter.register(&case_id) {
                debug!(case_id = %case_id, error = %err, "admission deferred");
                report.deferred.push(case_id);
                continue;
            }
            let store = self.store.clone();
            let id = case_id.clone();
            if let Err(err) = blocking(move || store.mark_running(&id)).await {
                warn!(case_id = %case_id, error = %err, "could not mark case running");
                self.limiter.retire(&case_id);
                continue;
            }
            info!(case_id = %case_id, "case admitted");
            self.spawn_case(&case_id);
            report.admitted.push(case_id);
        }
        Ok(report)
    }

    fn spawn_case(&mut self, case_id: &str) {
        let case_id = case_id.to_string();
        let store = self.store.clone();
        let limiter = Arc::clone(&self.limiter);
        let runner = Arc::clone(&self.runner);
        let backoff = self.options.backoff;
        let evaluator = CaseEvaluator::new(
            &case_id,
            Arc::clone(&self.limiter),
            Arc::clone(&self.dispatcher),
            self.options.backoff,
        );
        self.running.spawn(async move {
            let verdict = match CaseLog::open(&store.log_path(&case_id)) {
                Ok(log) => {
                    let ctx = CaseContext {
                        case_id: case_id.clone(),
                        case_dir: store.case_dir(&case_id),
                        log: Arc::new(log),
                        evaluator,
                    };
                    run_to_verdict(runner, ctx).await
                }
                Err(err) => Terminal::Failed {
                    reason: format!("cannot open case log: {}", err),
                },
            };
            finish_case(store, limiter, case_id, verdict, backoff).await
        });
    }

    /// Waits for every running case to reach a terminal state.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            reap(joined);
        }
    }

    /// Owns the queue until `shutdown` resolves, then stops admitting and
    /// drains the running cases.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let owner = self.store.acquire_scheduler_lock()?;
        info!(lock = %owner.path().display(), "scheduler started");

        let store = self.store.clone();
        let recovery = self.options.recovery;
        let recovered = blocking(move || store.recover_interrupted(recovery)).await?;
        if !recovered.is_empty() {
            info!(cases = ?recovered, ?recovery, "interrupted cases recovered");
        }

        tokio::pin!(shutdown);
        loop {
            match self.tick().await {
                Ok(report) if !report.deferred.is_empty() => {
                    debug!(deferred = report.deferred.len(), "active set full");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "admission pass failed"),
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!(running = self.running.len(), "shutdown requested, draining");
                    break;
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => reap(joined),
                _ = tokio::time::sleep(self.options.idle_poll) => {}
            }
        }
        self.drain().await;
        info!("scheduler stopped");
        Ok(())
    }
}

async fn run_to_verdict(runner: Arc<dyn CaseRunner>, ctx: CaseContext) -> Terminal {
    let log = Arc::clone(&ctx.log);
    let case_id = ctx.case_id.clone();
    note(&log, &case_id, "case started");
    // A separate task so a panicking runner still reaches a terminal state.
    let joined = tokio::spawn(async move { runner.run(&ctx).await }).await;
    match joined {
        Ok(Ok(outcome)) => {
            info!(case_id = %case_id, summary = %outcome.summary, "case done");
            note(&log, &case_id, &format!("case done: {}", outcome.summary));
            Terminal::Done {
                result_ref: outcome.result_ref,
            }
        }
        Ok(Err(err)) => {
            if let Some(Error::LedgerInvariantViolation { .. }) = err.downcast_ref::<Error>() {
                error!(case_id = %case_id, error = %err, "case halted on ledger invariant violation");
            } else {
                warn!(case_id = %case_id, error = %err, "case failed");
            }
            note(&log, &case_id, &format!("case failed: {:#}", err));
            Terminal::Failed {
                reason: err.to_string(),
            }
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "case runner panicked"
            } else {
                "case runner cancelled"
            };
            error!(case_id = %case_id, "{}", reason);
            note(&log, &case_id, reason);
            Terminal::Failed {
                reason: reason.to_string(),
            }
        }
    }
}

async fn finish_case(
    store: JobQueueStore,
    limiter: Arc<FairLimiter>,
    case_id: String,
    verdict: Terminal,
    backoff: PollBackoff,
) -> String {
    // Retire first: once the record is terminal the case may be resubmitted.
    limiter.retire_when_drained(&case_id).await;
    let mut delay = backoff.initial;
    for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
        let store = store.clone();
        let id = case_id.clone();
        let terminal = verdict.clone();
        match blocking(move || store.mark_terminal(&id, terminal)).await {
            Ok(_) => return case_id,
            Err(err) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                warn!(case_id = %case_id, attempt, error = %err, "terminal write failed, retrying");
                tokio::time::sleep(delay).await;
                delay = backoff.next(delay);
            }
            Err(err) => {
                error!(
                    case_id = %case_id,
                    attempts = TERMINAL_WRITE_ATTEMPTS,
                    error = %err,
                    "failed to record terminal state; left running until recovery"
                );
            }
        }
    }
    case_id
}

fn note(log: &CaseLog, case_id: &str, line: &str) {
    if let Err(err) = log.line(line) {
        warn!(case_id, error = %err, "case log write failed");
    }
}

fn reap(joined: std::result::Result<String, JoinError>) {
    match joined {
        Ok(case_id) => debug!(case_id = %case_id, "case task finished"),
        Err(err) => error!(error = %err, "case task aborted before bookkeeping"),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("queue task failed: {}", e))?
}
