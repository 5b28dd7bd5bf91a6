use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::dispatcher::{Dispatcher, EvalOrigin, EvalPayload, JobState, JobStatus};
use crate::plan::{BatchSearch, Evaluated, OptimizationPlan, RefineChain};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn temp_root(label: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir().join(format!(
        "optq_{}_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros(),
        n
    ));
    std::fs::create_dir_all(&root).expect("create temp root");
    root
}

type FailPredicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct MockJob {
    case_id: String,
    params: Value,
    submitted: Instant,
    settled: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    jobs: HashMap<String, MockJob>,
    in_flight: HashMap<String, usize>,
    peak_by_case: HashMap<String, usize>,
    total_in_flight: usize,
    peak_total: usize,
    origins: Vec<EvalOrigin>,
}

/// In-memory dispatcher. A job stays `pending` for `latency` after submission,
/// then settles to `done` with `{"echo": params}` or to `error` when the
/// failure predicate matches its params.
pub(crate) struct MockDispatcher {
    latency: Duration,
    state: Mutex<MockState>,
    fail: Mutex<Option<FailPredicate>>,
}

impl MockDispatcher {
    pub(crate) fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            state: Mutex::new(MockState::default()),
            fail: Mutex::new(None),
        })
    }

    pub(crate) fn fail_when(&self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) {
        *self.fail.lock().expect("fail lock") = Some(Box::new(predicate));
    }

    pub(crate) fn submitted(&self) -> usize {
        self.state.lock().expect("state lock").origins.len()
    }

    pub(crate) fn origins(&self) -> Vec<EvalOrigin> {
        self.state.lock().expect("state lock").origins.clone()
    }

    /// Most jobs outstanding at once across all cases.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.state.lock().expect("state lock").peak_total
    }

    pub(crate) fn peak_for(&self, case_id: &str) -> usize {
        self.state
            .lock()
            .expect("state lock")
            .peak_by_case
            .get(case_id)
            .copied()
            .unwrap_or(0)
    }

    fn should_fail(&self, params: &Value) -> bool {
        self.fail
            .lock()
            .expect("fail lock")
            .as_ref()
            .map(|f| f(params))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn submit(&self, payload: &EvalPayload) -> Result<String> {
        let mut state = self.state.lock().expect("state lock");
        state.next_id += 1;
        let job_id = format!("job-{}", state.next_id);
        state.jobs.insert(
            job_id.clone(),
            MockJob {
                case_id: payload.case_id.clone(),
                params: payload.params.clone(),
                submitted: Instant::now(),
                settled: false,
            },
        );
        state.origins.push(payload.origin.clone());
        let current = {
            let entry = state.in_flight.entry(payload.case_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let peak = state.peak_by_case.entry(payload.case_id.clone()).or_insert(0);
        *peak = (*peak).max(current);
        state.total_in_flight += 1;
        state.peak_total = state.peak_total.max(state.total_in_flight);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus> {
        let params = {
            let mut state = self.state.lock().expect("state lock");
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| anyhow!("unknown job {}", job_id))?;
            if job.submitted.elapsed() < self.latency {
                return Ok(JobStatus {
                    state: JobState::Pending,
                    result: None,
                    error: None,
                });
            }
            let first_settle = !job.settled;
            job.settled = true;
            let case_id = job.case_id.clone();
            let params = job.params.clone();
            if first_settle {
                if let Some(n) = state.in_flight.get_mut(&case_id) {
                    *n = n.saturating_sub(1);
                }
                state.total_in_flight = state.total_in_flight.saturating_sub(1);
            }
            params
        };
        if self.should_fail(&params) {
            return Ok(JobStatus {
                state: JobState::Error,
                result: None,
                error: Some(format!("mock failure for {}", params)),
            });
        }
        Ok(JobStatus {
            state: JobState::Done,
            result: Some(json!({ "echo": params })),
            error: None,
        })
    }
}

/// Plan whose batch rounds propose `{"round", "index"}` candidates and whose
/// refinement chains step `chain_steps` times per seed.
pub(crate) struct ScriptedPlan {
    pub(crate) chain_steps: usize,
    pub(crate) converge_after_rounds: Option<usize>,
    /// Number of results told back per round.
    pub(crate) told: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedPlan {
    pub(crate) fn new(chain_steps: usize) -> Self {
        Self {
            chain_steps,
            converge_after_rounds: None,
            told: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

struct ScriptedSearch {
    round: usize,
    converge_after_rounds: Option<usize>,
    told: Arc<Mutex<Vec<usize>>>,
    best: Option<Value>,
}

impl BatchSearch for ScriptedSearch {
    fn ask(&mut self, batch_size: usize) -> Result<Vec<Value>> {
        let round = self.round;
        Ok((0..batch_size)
            .map(|index| json!({ "round": round, "index": index }))
            .collect())
    }

    fn tell(&mut self, evaluated: Vec<Evaluated>) -> Result<()> {
        self.told.lock().expect("told lock").push(evaluated.len());
        if let Some(last) = evaluated.last() {
            self.best = Some(last.params.clone());
        }
        self.round += 1;
        Ok(())
    }

    fn converged(&self) -> bool {
        self.converge_after_rounds
            .map(|n| self.round >= n)
            .unwrap_or(false)
    }

    fn best(&self) -> Option<Value> {
        self.best.clone()
    }
}

struct ScriptedChain {
    seed: u64,
    step: usize,
    limit: usize,
}

impl RefineChain for ScriptedChain {
    fn next_step(&mut self) -> Option<Value> {
        if self.step >= self.limit {
            return None;
        }
        Some(json!({ "seed": self.seed, "step": self.step }))
    }

    fn update(&mut self, _result: Value) -> Result<()> {
        self.step += 1;
        Ok(())
    }

    fn best(&self) -> Value {
        json!({ "seed": self.seed, "steps": self.step })
    }
}

impl OptimizationPlan for ScriptedPlan {
    fn batch_search(&self, _case_id: &str) -> Result<Box<dyn BatchSearch>> {
        Ok(Box::new(ScriptedSearch {
            round: 0,
            converge_after_rounds: self.converge_after_rounds,
            told: Arc::clone(&self.told),
            best: None,
        }))
    }

    fn refine_chain(
        &self,
        _case_id: &str,
        seed: u64,
        _incumbent: Option<&Value>,
    ) -> Result<Box<dyn RefineChain>> {
        Ok(Box::new(ScriptedChain {
            seed,
            step: 0,
            limit: self.chain_steps,
        }))
    }

    fn commit(&self, case_id: &str, bests: Vec<Value>) -> Result<Value> {
        Ok(json!({ "case_id": case_id, "bests": bests }))
    }
}
