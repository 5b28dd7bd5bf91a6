//! The two shapes a case can take once admitted: a fixed sequence of external
//! stage processes, or batch-search rounds followed by parallel refinement
//! chains.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{BatchFailurePolicy, IterativeConfig, StageSpec, StagedConfig};
use crate::dispatcher::EvalOrigin;
use crate::error::Error;
use crate::evaluator::CaseEvaluator;
use crate::plan::{Evaluated, OptimizationPlan};
use crate::{atomic_write_json_pretty, ensure_dir};

/// Append-only, human-readable log of one case.
#[derive(Debug)]
pub struct CaseLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CaseLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, message: impl AsRef<str>) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), message.as_ref())?;
        Ok(())
    }

    /// stdout/stderr handles for a child process, both appending to this log.
    fn child_stdio(&self) -> Result<(Stdio, Stdio)> {
        let out = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let err = out.try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }
}

/// Everything a runner needs to drive one admitted case.
#[derive(Clone)]
pub struct CaseContext {
    pub case_id: String,
    pub case_dir: PathBuf,
    pub log: Arc<CaseLog>,
    pub evaluator: CaseEvaluator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    pub result_ref: Option<String>,
    pub summary: String,
}

#[async_trait]
pub trait CaseRunner: Send + Sync {
    async fn run(&self, ctx: &CaseContext) -> Result<CaseOutcome>;
}

pub struct StagedPipeline {
    config: StagedConfig,
}

impl StagedPipeline {
    pub fn new(config: StagedConfig) -> Self {
        Self { config }
    }

    /// Runs one stage process with output appended to the case log. Returns the
    /// exit code as text, `signal` when killed, or a spawn error label.
    async fn run_stage(&self, ctx: &CaseContext, stage: &StageSpec, config_path: &Path) -> Result<String> {
        let argv = stage_argv(&stage.command, config_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("stage {} has an empty command", stage.name))?;
        ctx.log.line(format!("$ {}", shell_join(&argv)))?;
        let (stdout, stderr) = ctx.log.child_stdio()?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("OPTQ_CASE_ID", &ctx.case_id)
            .env("OPTQ_CASE_DIR", &ctx.case_dir)
            .env("OPTQ_CONFIG_PATH", config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(workdir) = &stage.workdir {
            cmd.current_dir(workdir);
        }
        let status = match cmd.status().await {
            Ok(status) => status,
            Err(err) => return Ok(format!("spawn error ({})", err)),
        };
        Ok(status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()))
    }
}

#[async_trait]
impl CaseRunner for StagedPipeline {
    async fn run(&self, ctx: &CaseContext) -> Result<CaseOutcome> {
        let config_path = ctx.case_dir.join(&self.config.config_file);
        let total = self.config.stages.len();
        for (idx, stage) in self.config.stages.iter().enumerate() {
            info!(case_id = %ctx.case_id, stage = %stage.name, "stage started");
            ctx.log
                .line(format!("stage {}/{} {} started", idx + 1, total, stage.name))?;
            let exit = ctx
                .evaluator
                .with_slot(self.run_stage(ctx, stage, &config_path))
                .await?;
            if exit != "0" {
                ctx.log
                    .line(format!("stage {} failed: exit {}", stage.name, exit))?;
                warn!(case_id = %ctx.case_id, stage = %stage.name, exit = %exit, "stage failed");
                return Err(Error::StageFailed {
                    case_id: ctx.case_id.clone(),
                    stage: stage.name.clone(),
                    exit,
                }
                .into());
            }
            ctx.log.line(format!("stage {} finished", stage.name))?;
        }
        Ok(CaseOutcome {
            result_ref: None,
            summary: format!("{} stages completed", total),
        })
    }
}

/// Substitutes `{config}` in every argument; appends `-c <config>` when no
/// argument mentions it.
pub fn stage_argv(command: &[String], config_path: &Path) -> Vec<String> {
    let config = config_path.display().to_string();
    let mut placeholder = false;
    let mut argv: Vec<String> = command
        .iter()
        .map(|arg| {
            if arg.contains("{config}") {
                placeholder = true;
                arg.replace("{config}", &config)
            } else {
                arg.clone()
            }
        })
        .collect();
    if !placeholder {
        argv.push("-c".to_string());
        argv.push(config);
    }
    argv
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:{}".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

pub struct IterativeOptimization {
    config: IterativeConfig,
    plan: Arc<dyn OptimizationPlan>,
}

impl IterativeOptimization {
    pub fn new(config: IterativeConfig, plan: Arc<dyn OptimizationPlan>) -> Self {
        Self { config, plan }
    }

    /// One refinement chain: strictly sequential, capped at `max_refine_steps`.
    async fn refine(&self, ctx: &CaseContext, seed: u64, incumbent: Option<&Value>) -> Result<Value> {
        let mut chain = self.plan.refine_chain(&ctx.case_id, seed, incumbent)?;
        let mut step = 0;
        while let Some(params) = chain.next_step() {
            if step >= self.config.max_refine_steps {
                warn!(case_id = %ctx.case_id, seed, "refinement step budget exhausted");
                ctx.log.line(format!(
                    "seed {} stopped at step budget {}",
                    seed, self.config.max_refine_steps
                ))?;
                break;
            }
            let result = ctx
                .evaluator
                .evaluate(EvalOrigin::RefineStep { seed, step }, params)
                .await?;
            chain.update(result)?;
            step += 1;
        }
        ctx.log
            .line(format!("seed {} finished after {} steps", seed, step))?;
        Ok(chain.best())
    }
}

#[async_trait]
impl CaseRunner for IterativeOptimization {
    async fn run(&self, ctx: &CaseContext) -> Result<CaseOutcome> {
        let cfg = &self.config;
        let mut search = self.plan.batch_search(&ctx.case_id)?;
        let mut rounds_run = 0;

        for round in 0..cfg.rounds {
            let candidates = search.ask(cfg.batch_size)?;
            if candidates.is_empty() {
                ctx.log.line(format!("batch search exhausted before round {}", round + 1))?;
                break;
            }
            let size = candidates.len();
            info!(case_id = %ctx.case_id, round, candidates = size, "batch round started");
            ctx.log
                .line(format!("round {} started: {} candidates", round + 1, size))?;

            let evaluations = candidates.into_iter().enumerate().map(|(index, params)| {
                let evaluator = ctx.evaluator.clone();
                async move {
                    let outcome = evaluator
                        .evaluate(EvalOrigin::BatchCandidate { round, index }, params.clone())
                        .await;
                    (index, params, outcome)
                }
            });
            // Barrier: the round is told only once every candidate has settled.
            let settled = join_all(evaluations).await;

            let mut evaluated = Vec::with_capacity(size);
            let mut failures = Vec::new();
            for (index, params, outcome) in settled {
                match outcome {
                    Ok(result) => evaluated.push(Evaluated { params, result }),
                    Err(err) => failures.push((index, err)),
                }
            }

            if !failures.is_empty() {
                let droppable = cfg.batch_failure == BatchFailurePolicy::DropCandidate
                    && failures.iter().all(|(_, err)| {
                        matches!(err.downcast_ref::<Error>(), Some(Error::EvaluationFailed { .. }))
                    });
                let failed: Vec<usize> = failures.iter().map(|(i, _)| *i).collect();
                if !droppable {
                    ctx.log.line(format!(
                        "round {} aborted: candidates {:?} failed; partial results: {}",
                        round + 1,
                        failed,
                        serde_json::to_string(&evaluated)?
                    ))?;
                    let (_, err) = failures.swap_remove(0);
                    if let Some(Error::LedgerInvariantViolation { .. }) = err.downcast_ref::<Error>() {
                        error!(case_id = %ctx.case_id, error = %err, "ledger invariant violated");
                    }
                    return Err(err);
                }
                warn!(case_id = %ctx.case_id, round, dropped = failed.len(), "dropping failed candidates");
                ctx.log.line(format!(
                    "round {}: dropped failed candidates {:?}",
                    round + 1,
                    failed
                ))?;
            }

            ctx.log.line(format!(
                "round {} finished: {} results",
                round + 1,
                evaluated.len()
            ))?;
            search.tell(evaluated)?;
            rounds_run += 1;
            if search.converged() {
                ctx.log.line(format!("batch search converged after round {}", round + 1))?;
                break;
            }
        }

        let incumbent = search.best();
        let seeds = self.plan.seeds(&ctx.case_id, cfg.seeds);
        ctx.log
            .line(format!("refinement started: {} seeds", seeds.len()))?;
        let chains = seeds
            .iter()
            .map(|&seed| self.refine(ctx, seed, incumbent.as_ref()));
        let bests = try_join_all(chains).await?;

        let result = self.plan.commit(&ctx.case_id, bests)?;
        let result_path = ctx.case_dir.join("results").join("optimization.json");
        atomic_write_json_pretty(&result_path, &result)?;
        ctx.log
            .line(format!("result written to {}", result_path.display()))?;
        Ok(CaseOutcome {
            result_ref: Some(result_path.display().to_string()),
            summary: format!("{} rounds, {} seeds", rounds_run, seeds.len()),
        })
    }
}

/// Reads the log written so far; used by tests and the status surface.
pub(crate) fn read_log(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
