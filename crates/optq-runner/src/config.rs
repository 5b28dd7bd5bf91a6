//! Scheduler configuration, loaded from YAML.
//!
//! Every field has a default so an empty file is a valid configuration for a
//! staged pipeline once `pipeline.stages` is filled in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ledger::Capacity;
use crate::logging::LogConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub limits: LimitsConfig,
    pub scheduler: LoopConfig,
    pub dispatcher: DispatcherConfig,
    pub pipeline: PipelineConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Durable queue file; the scheduler lock file sits next to it.
    pub path: PathBuf,
    /// Relative case ids are resolved against this directory.
    pub cases_root: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tasks/queue.json"),
            cases_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// `P`: evaluation slots shared by every case.
    pub ports: usize,
    /// `CaseCap`: per-case ceiling once more than one case is active.
    pub case_cap: usize,
    /// `C`: cases that may be active at once.
    pub max_active_cases: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ports: 50,
            case_cap: 5,
            max_active_cases: 10,
        }
    }
}

impl LimitsConfig {
    pub fn capacity(&self) -> Capacity {
        Capacity {
            ports: self.ports,
            case_cap: self.case_cap,
            max_cases: self.max_active_cases,
        }
    }
}

/// What happens to a case found `running` when the scheduler starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Put it back to `waiting`; it restarts from its first phase.
    Requeue,
    /// Mark it `failed` with reason `interrupted` and drop its lock marker.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub idle_poll_ms: u64,
    pub recovery: RecoveryPolicy,
    /// Progress percent reported while a case runs.
    pub running_progress: u8,
    pub log_tail_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 5_000,
            recovery: RecoveryPolicy::Requeue,
            running_progress: 90,
            log_tail_chars: 3_000,
        }
    }
}

impl LoopConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub endpoint: String,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://dispatcher:8000".to_string(),
            poll_initial_ms: 400,
            poll_max_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn backoff(&self) -> PollBackoff {
        PollBackoff {
            initial: Duration::from_millis(self.poll_initial_ms),
            max: Duration::from_millis(self.poll_max_ms),
        }
    }
}

/// Bounded exponential backoff between dispatcher status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl PollBackoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        DispatcherConfig::default().backoff()
    }
}

/// Which way a case is driven. Each kind lists the fields it requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineConfig {
    Staged(StagedConfig),
    Iterative(IterativeConfig),
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::Staged(StagedConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedConfig {
    /// Shared configuration artifact, relative to the case directory.
    pub config_file: PathBuf,
    pub stages: Vec<StageSpec>,
}

impl Default for StagedConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("configs/config.json"),
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Program and arguments. `{config}` is replaced with the configuration path;
    /// without a placeholder `-c <config>` is appended.
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// What a batch round does when one of its evaluations fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Wait for the rest of the round, log the partial results, fail the case.
    AbortRound,
    /// Feed only the successful candidates back and continue.
    DropCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeConfig {
    pub rounds: usize,
    pub batch_size: usize,
    pub seeds: usize,
    pub max_refine_steps: usize,
    pub batch_failure: BatchFailurePolicy,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            rounds: 10,
            batch_size: 8,
            seeds: 5,
            max_refine_steps: 200,
            batch_failure: BatchFailurePolicy::AbortRound,
        }
    }
}

impl SchedulerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        let mut config: SchedulerConfig = if raw.trim().is_empty() {
            SchedulerConfig::default()
        } else {
            serde_yaml::from_str(&raw)?
        };
        config.resolve_relative_to(path.parent().unwrap_or(Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    /// Anchors relative queue paths at the config file's directory.
    fn resolve_relative_to(&mut self, base: &Path) {
        if self.queue.path.is_relative() {
            self.queue.path = base.join(&self.queue.path);
        }
        if self.queue.cases_root.is_relative() {
            self.queue.cases_root = base.join(&self.queue.cases_root);
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        let mut problems = Vec::new();
        if self.limits.ports == 0 {
            problems.push("limits.ports must be > 0");
        }
        if self.limits.case_cap == 0 {
            problems.push("limits.case_cap must be > 0");
        }
        if self.limits.max_active_cases == 0 {
            problems.push("limits.max_active_cases must be > 0");
        }
        if self.dispatcher.poll_initial_ms == 0 {
            problems.push("dispatcher.poll_initial_ms must be > 0");
        }
        if self.dispatcher.poll_max_ms < self.dispatcher.poll_initial_ms {
            problems.push("dispatcher.poll_max_ms must be >= poll_initial_ms");
        }
        if self.scheduler.running_progress > 100 {
            problems.push("scheduler.running_progress must be <= 100");
        }
        match &self.pipeline {
            PipelineConfig::Staged(staged) => {
                if staged.stages.is_empty() {
                    problems.push("pipeline.stages must not be empty");
                }
                if staged.stages.iter().any(|s| s.command.is_empty()) {
                    problems.push("every stage needs a non-empty command");
                }
            }
            PipelineConfig::Iterative(it) => {
                if it.batch_size == 0 {
                    problems.push("pipeline.batch_size must be > 0");
                }
                if it.max_refine_steps == 0 {
                    problems.push("pipeline.max_refine_steps must be > 0");
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Template written by `optq init`.
pub const CONFIG_TEMPLATE: &str = "\
queue:
  path: tasks/queue.json          # durable queue, scheduler.lock lives next to it
  cases_root: ../Case             # relative case ids resolve here
limits:
  ports: 50                       # P: shared evaluation slots
  case_cap: 5                     # per-case ceiling under contention
  max_active_cases: 10            # C: concurrently active cases
scheduler:
  idle_poll_ms: 5000
  recovery: requeue               # requeue | fail for cases interrupted by a restart
  running_progress: 90
  log_tail_chars: 3000
dispatcher:
  endpoint: http://dispatcher:8000
  poll_initial_ms: 400
  poll_max_ms: 5000
  request_timeout_ms: 30000
pipeline:
  kind: staged
  config_file: configs/config.json
  stages:
    - name: fit_1
      command: [python, '../Fitting BSL/script1.py', -c, '{config}']
    - name: reg_7
      command: [python, ../Reg/script7.py, -c, '{config}']
logging:
  level: info
  format: pretty
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_and_validates() {
        let config: SchedulerConfig = serde_yaml::from_str(CONFIG_TEMPLATE).expect("template");
        config.validate().expect("template is valid");
        assert_eq!(config.limits.ports, 50);
        assert_eq!(config.scheduler.recovery, RecoveryPolicy::Requeue);
        match config.pipeline {
            PipelineConfig::Staged(staged) => {
                assert_eq!(staged.stages.len(), 2);
                assert_eq!(staged.stages[0].name, "fit_1");
            }
            other => panic!("expected staged pipeline, got {:?}", other),
        }
    }

    #[test]
    fn iterative_pipeline_uses_defaults_for_missing_fields() {
        let raw = "pipeline:\n  kind: iterative\n  rounds: 3\n";
        let config: SchedulerConfig = serde_yaml::from_str(raw).expect("parse");
        match config.pipeline {
            PipelineConfig::Iterative(it) => {
                assert_eq!(it.rounds, 3);
                assert_eq!(it.batch_size, 8);
                assert_eq!(it.batch_failure, BatchFailurePolicy::AbortRound);
            }
            other => panic!("expected iterative pipeline, got {:?}", other),
        }
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = SchedulerConfig::default();
        config.limits.ports = 0;
        config.limits.max_active_cases = 0;
        let msg = config.validate().expect_err("invalid").to_string();
        assert!(msg.contains("limits.ports"), "{}", msg);
        assert!(msg.contains("limits.max_active_cases"), "{}", msg);
        assert!(msg.contains("pipeline.stages"), "{}", msg);
    }

    #[test]
    fn backoff_is_bounded() {
        let backoff = PollBackoff {
            initial: Duration::from_millis(400),
            max: Duration::from_millis(1_000),
        };
        let second = backoff.next(backoff.initial);
        assert_eq!(second, Duration::from_millis(800));
        assert_eq!(backoff.next(second), Duration::from_millis(1_000));
    }
}
