//! One case's gateway to the port pool: every unit of work runs while holding a
//! limiter permit.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::PollBackoff;
use crate::dispatcher::{Dispatcher, EvalOrigin, EvalPayload, JobState};
use crate::error::Error;
use crate::limiter::FairLimiter;

#[derive(Clone)]
pub struct CaseEvaluator {
    case_id: String,
    limiter: Arc<FairLimiter>,
    dispatcher: Arc<dyn Dispatcher>,
    backoff: PollBackoff,
}

impl CaseEvaluator {
    pub fn new(
        case_id: &str,
        limiter: Arc<FairLimiter>,
        dispatcher: Arc<dyn Dispatcher>,
        backoff: PollBackoff,
    ) -> Self {
        Self {
            case_id: case_id.to_string(),
            limiter,
            dispatcher,
            backoff,
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Runs `work` while holding one port for this case. The port is returned
    /// whether `work` succeeds, fails or is cancelled.
    pub async fn with_slot<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.limiter.acquire(&self.case_id).await?;
        let out = work.await;
        permit.release()?;
        out
    }

    /// Submits one payload to the dispatcher and waits for its terminal state.
    ///
    /// A dispatcher-side `error` becomes [`Error::EvaluationFailed`]; there is no
    /// automatic retry.
    pub async fn evaluate(&self, origin: EvalOrigin, params: Value) -> Result<Value> {
        let payload = EvalPayload {
            case_id: self.case_id.clone(),
            origin,
            params,
        };
        self.with_slot(self.dispatch(&payload)).await
    }

    async fn dispatch(&self, payload: &EvalPayload) -> Result<Value> {
        let job_id = self.dispatcher.submit(payload).await?;
        debug!(case_id = %self.case_id, job_id = %job_id, "evaluation submitted");
        let mut delay = self.backoff.initial;
        loop {
            tokio::time::sleep(delay).await;
            let status = self.dispatcher.poll(&job_id).await?;
            match status.state {
                JobState::Pending => delay = self.backoff.next(delay),
                JobState::Done => {
                    return Ok(status.result.unwrap_or(Value::Null));
                }
                JobState::Error => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "dispatcher reported error".to_string());
                    warn!(case_id = %self.case_id, job_id = %job_id, error = %message, "evaluation failed");
                    return Err(Error::EvaluationFailed {
                        case_id: self.case_id.clone(),
                        message,
                    }
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Capacity;
    use crate::test_support::MockDispatcher;
    use serde_json::json;
    use std::time::Duration;

    fn evaluator(dispatcher: Arc<MockDispatcher>, ports: usize) -> (CaseEvaluator, Arc<FairLimiter>) {
        let limiter = FairLimiter::new(Capacity {
            ports,
            case_cap: 5,
            max_cases: 10,
        });
        let backoff = PollBackoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        };
        (
            CaseEvaluator::new("A", Arc::clone(&limiter), dispatcher, backoff),
            limiter,
        )
    }

    #[tokio::test]
    async fn evaluate_returns_result_and_frees_port() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(5));
        let (eval, limiter) = evaluator(Arc::clone(&dispatcher), 2);
        let out = eval
            .evaluate(EvalOrigin::RefineStep { seed: 1, step: 0 }, json!({ "x": 3 }))
            .await
            .expect("evaluate");
        assert_eq!(out, json!({ "echo": { "x": 3 } }));
        assert_eq!(limiter.snapshot().global_count, 0);
        assert_eq!(dispatcher.submitted(), 1);
    }

    #[tokio::test]
    async fn dispatcher_error_is_evaluation_failed() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(1));
        dispatcher.fail_when(|params| params.get("bad").is_some());
        let (eval, limiter) = evaluator(dispatcher, 2);
        let err = eval
            .evaluate(
                EvalOrigin::BatchCandidate { round: 0, index: 0 },
                json!({ "bad": true }),
            )
            .await
            .expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::EvaluationFailed { .. })
        ));
        assert_eq!(limiter.snapshot().global_count, 0, "port returned on failure");
    }

    #[tokio::test]
    async fn cancelled_evaluation_returns_its_port() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(500));
        let (eval, limiter) = evaluator(dispatcher, 1);
        let pending = eval.evaluate(
            EvalOrigin::BatchCandidate { round: 0, index: 0 },
            json!({}),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(limiter.snapshot().global_count, 0);
    }
}
