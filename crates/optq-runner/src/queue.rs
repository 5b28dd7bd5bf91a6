//! Durable job queue and per-case lock markers.
//!
//! The queue is a JSON array of [`CaseRecord`]s rewritten atomically on every
//! mutation. Every mutation, and every marker creation or removal, happens while
//! holding an exclusive OS lock on `<queue>.lock`, so a marker that has no
//! non-terminal record behind it can only be a crash leftover.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, RecoveryPolicy};
use crate::runner::CaseLog;
use crate::{atomic_write_bytes, ensure_dir};

pub const MARKER_FILE: &str = "running.flag";
pub const LOG_FILE: &str = "optimization.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Waiting,
    Running,
    Done,
    Failed,
}

impl CaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Done | CaseStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Waiting => "waiting",
            CaseStatus::Running => "running",
            CaseStatus::Done => "done",
            CaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub status: CaseStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub log_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Added,
    AlreadyPresent,
}

/// Final state written by [`JobQueueStore::mark_terminal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Done { result_ref: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerBody {
    case_id: String,
    pid: u32,
    created_at: DateTime<Utc>,
}

/// Held for the duration of one queue read-modify-write.
struct QueueLock {
    file: File,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Removes a freshly created marker unless the queue append that follows it
/// succeeds.
struct MarkerGuard {
    path: PathBuf,
    armed: bool,
}

impl MarkerGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Exclusive ownership of a queue by one scheduler loop; released on drop or
/// process death.
#[derive(Debug)]
pub struct SchedulerLock {
    file: File,
    path: PathBuf,
}

impl SchedulerLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueStore {
    queue_path: PathBuf,
    cases_root: PathBuf,
}

impl JobQueueStore {
    pub fn new(queue_path: impl Into<PathBuf>, cases_root: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
            cases_root: cases_root.into(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(&config.path, &config.cases_root)
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.cases_root.join(case_id)
    }

    pub fn log_path(&self, case_id: &str) -> PathBuf {
        self.case_dir(case_id).join(LOG_FILE)
    }

    pub fn marker_path(&self, case_id: &str) -> PathBuf {
        self.case_dir(case_id).join(MARKER_FILE)
    }

    fn sibling(&self, name: &str) -> PathBuf {
        self.queue_path.with_file_name(name)
    }

    fn lock(&self) -> Result<QueueLock> {
        let file_name = self
            .queue_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("queue.json");
        let path = self.sibling(&format!("{}.lock", file_name));
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open queue lock {}", path.display()))?;
        file.lock_exclusive()?;
        Ok(QueueLock { file })
    }

    fn load(&self) -> Result<Vec<CaseRecord>> {
        let bytes = match fs::read(&self.queue_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("queue file {} is not a record list", self.queue_path.display()))
    }

    fn save(&self, records: &[CaseRecord]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        atomic_write_bytes(&self.queue_path, &bytes)
    }

    fn remove_marker(&self, case_id: &str) {
        let path = self.marker_path(case_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(case_id, error = %err, "failed to remove lock marker"),
        }
    }

    fn create_marker(&self, case_id: &str) -> Result<Option<MarkerGuard>> {
        let path = self.marker_path(case_id);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let body = MarkerBody {
                    case_id: case_id.to_string(),
                    pid: std::process::id(),
                    created_at: Utc::now(),
                };
                file.write_all(&serde_json::to_vec(&body)?)?;
                file.sync_all()?;
                Ok(Some(MarkerGuard { path, armed: true }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Enqueues a case unless it is already waiting or running.
    pub fn submit(&self, case_id: &str) -> Result<SubmitOutcome> {
        if case_id.trim().is_empty() {
            bail!("case id must not be empty");
        }
        let _lock = self.lock()?;
        let mut records = self.load()?;
        if records
            .iter()
            .any(|r| r.case_id == case_id && !r.status.is_terminal())
        {
            debug!(case_id, "submit ignored: case already queued");
            return Ok(SubmitOutcome::AlreadyPresent);
        }
        let marker_path = self.marker_path(case_id);
        if marker_path.exists() {
            let finished = records
                .iter()
                .rev()
                .find(|r| r.case_id == case_id)
                .is_some_and(|r| r.status.is_terminal());
            if !finished {
                debug!(case_id, "submit ignored: lock marker present");
                return Ok(SubmitOutcome::AlreadyPresent);
            }
            warn!(case_id, "reclaiming lock marker left by a finished case");
            fs::remove_file(&marker_path)?;
        }
        let mut marker = match self.create_marker(case_id)? {
            Some(marker) => marker,
            None => return Ok(SubmitOutcome::AlreadyPresent),
        };
        records.push(CaseRecord {
            case_id: case_id.to_string(),
            status: CaseStatus::Waiting,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            log_ref: self.log_path(case_id).display().to_string(),
            result_ref: None,
            failure: None,
        });
        self.save(&records)?;
        marker.disarm();
        info!(case_id, "case submitted");
        Ok(SubmitOutcome::Added)
    }

    /// Turns a waiting case into `failed` with reason `withdrawn`. Returns
    /// `false` when the case is not waiting.
    pub fn withdraw(&self, case_id: &str) -> Result<bool> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let Some(idx) = latest_live(&records, case_id) else {
            return Ok(false);
        };
        if records[idx].status != CaseStatus::Waiting {
            return Ok(false);
        }
        let record = &mut records[idx];
        record.status = CaseStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.failure = Some("withdrawn".to_string());
        self.save(&records)?;
        self.remove_marker(case_id);
        info!(case_id, "case withdrawn");
        Ok(true)
    }

    /// Waiting records in submission order.
    pub fn list_waiting(&self) -> Result<Vec<CaseRecord>> {
        Ok(self
            .list_cases()?
            .into_iter()
            .filter(|r| r.status == CaseStatus::Waiting)
            .collect())
    }

    /// Every record, terminal ones included, in submission order.
    pub fn list_cases(&self) -> Result<Vec<CaseRecord>> {
        let _lock = self.lock()?;
        self.load()
    }

    /// Most recent record for a case id.
    pub fn latest(&self, case_id: &str) -> Result<Option<CaseRecord>> {
        Ok(self
            .list_cases()?
            .into_iter()
            .rev()
            .find(|r| r.case_id == case_id))
    }

    pub fn mark_running(&self, case_id: &str) -> Result<CaseRecord> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let idx = latest_live(&records, case_id)
            .filter(|&i| records[i].status == CaseStatus::Waiting)
            .ok_or_else(|| anyhow!("case {} is not waiting", case_id))?;
        records[idx].status = CaseStatus::Running;
        records[idx].started_at = Some(Utc::now());
        self.save(&records)?;
        Ok(records[idx].clone())
    }

    /// Records the final state of the case's running record and drops its marker.
    pub fn mark_terminal(&self, case_id: &str, terminal: Terminal) -> Result<CaseRecord> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let idx = latest_live(&records, case_id)
            .filter(|&i| records[i].status == CaseStatus::Running)
            .ok_or_else(|| anyhow!("case {} is not running", case_id))?;
        let record = &mut records[idx];
        record.finished_at = Some(Utc::now());
        match terminal {
            Terminal::Done { result_ref } => {
                record.status = CaseStatus::Done;
                record.result_ref = result_ref;
            }
            Terminal::Failed { reason } => {
                record.status = CaseStatus::Failed;
                record.failure = Some(reason);
            }
        }
        let updated = record.clone();
        self.save(&records)?;
        self.remove_marker(case_id);
        Ok(updated)
    }

    /// Resolves records left `running` by a previous scheduler. Call only while
    /// holding the [`SchedulerLock`].
    pub fn recover_interrupted(&self, policy: RecoveryPolicy) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let mut recovered = Vec::new();
        for record in records.iter_mut().filter(|r| r.status == CaseStatus::Running) {
            match policy {
                RecoveryPolicy::Requeue => {
                    record.status = CaseStatus::Waiting;
                    record.started_at = None;
                }
                RecoveryPolicy::Fail => {
                    record.status = CaseStatus::Failed;
                    record.finished_at = Some(Utc::now());
                    record.failure = Some("interrupted".to_string());
                }
            }
            recovered.push(record.case_id.clone());
        }
        if recovered.is_empty() {
            return Ok(recovered);
        }
        self.save(&records)?;
        for case_id in &recovered {
            let note = match policy {
                RecoveryPolicy::Requeue => "scheduler restarted: case requeued",
                RecoveryPolicy::Fail => "scheduler restarted: case marked failed",
            };
            if policy == RecoveryPolicy::Fail {
                self.remove_marker(case_id);
            }
            let noted = CaseLog::open(&self.log_path(case_id)).and_then(|log| log.line(note));
            if let Err(err) = noted {
                warn!(case_id = %case_id, error = %err, "failed to note recovery in case log");
            }
        }
        info!(count = recovered.len(), ?policy, "recovered interrupted cases");
        Ok(recovered)
    }

    /// Takes the single-owner lock next to the queue file without blocking.
    pub fn acquire_scheduler_lock(&self) -> Result<SchedulerLock> {
        let path = self.sibling("scheduler.lock");
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "scheduler_already_running: {} is held by another scheduler",
                path.display()
            );
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(SchedulerLock { file, path })
    }
}

fn latest_live(records: &[CaseRecord], case_id: &str) -> Option<usize> {
    records
        .iter()
        .rposition(|r| r.case_id == case_id && !r.status.is_terminal())
}
