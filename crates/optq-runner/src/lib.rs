//! Fair-share scheduling of optimization cases over a shared pool of remote
//! evaluation ports, with a crash-safe on-disk queue.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod ledger;
pub mod limiter;
pub mod logging;
pub mod plan;
pub mod queue;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{CaseApi, CaseProgress, QueueCounts, SubmitReply};
pub use config::{
    BatchFailurePolicy, IterativeConfig, PipelineConfig, RecoveryPolicy, SchedulerConfig,
    StageSpec, StagedConfig,
};
pub use dispatcher::{Dispatcher, EvalOrigin, EvalPayload, HttpDispatcher, JobState, JobStatus};
pub use error::Error;
pub use evaluator::CaseEvaluator;
pub use ledger::{fair_allowance, Capacity, LedgerSnapshot};
pub use limiter::{FairLimiter, Permit};
pub use plan::{BatchSearch, Evaluated, OptimizationPlan, RefineChain};
pub use queue::{CaseRecord, CaseStatus, JobQueueStore, SubmitOutcome, Terminal};
pub use runner::{CaseContext, CaseLog, CaseOutcome, CaseRunner, IterativeOptimization, StagedPipeline};
pub use scheduler::{Scheduler, SchedulerOptions, TickReport};

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write-replace: readers see either the old bytes or the new bytes, never a
/// partial file.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use serde_json::json;

    #[test]
    fn atomic_write_replaces_whole_file() {
        let root = temp_root("atomic_write");
        let path = root.join("nested").join("state.json");
        atomic_write_json_pretty(&path, &json!({ "v": 1 })).expect("first write");
        atomic_write_json_pretty(&path, &json!({ "v": 2 })).expect("second write");
        let parsed: Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("valid json");
        assert_eq!(parsed, json!({ "v": 2 }));
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files must be renamed away");
        let _ = fs::remove_dir_all(root);
    }
}
