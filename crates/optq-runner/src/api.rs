//! Read and submit operations used by the CLI and the HTTP status surface.
//!
//! Everything here reads the durable queue directly, so answers stay correct
//! across scheduler restarts and from other processes.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::queue::{CaseRecord, CaseStatus, JobQueueStore, SubmitOutcome};
use crate::runner::read_log;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReply {
    pub case_id: String,
    pub added: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseProgress {
    pub case_id: String,
    pub status: Option<CaseStatus>,
    pub percent: u8,
    pub message: String,
    /// Seconds since the case started, or between start and finish once terminal.
    pub elapsed_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct CaseApi {
    store: JobQueueStore,
    running_progress: u8,
    log_tail_chars: usize,
}

impl CaseApi {
    pub fn new(store: JobQueueStore, running_progress: u8, log_tail_chars: usize) -> Self {
        Self {
            store,
            running_progress: running_progress.min(100),
            log_tail_chars,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            JobQueueStore::from_config(&config.queue),
            config.scheduler.running_progress,
            config.scheduler.log_tail_chars,
        )
    }

    pub fn store(&self) -> &JobQueueStore {
        &self.store
    }

    pub fn submit_case(&self, case_id: &str) -> Result<SubmitReply> {
        let added = self.store.submit(case_id)? == SubmitOutcome::Added;
        let message = if added {
            format!("added to queue: {}", case_id)
        } else {
            Error::DuplicateSubmission {
                case_id: case_id.to_string(),
            }
            .to_string()
        };
        Ok(SubmitReply {
            case_id: case_id.to_string(),
            added,
            message,
        })
    }

    pub fn withdraw_case(&self, case_id: &str) -> Result<bool> {
        self.store.withdraw(case_id)
    }

    /// Status of the most recent record for the case; `None` if never submitted.
    pub fn get_status(&self, case_id: &str) -> Result<Option<CaseStatus>> {
        Ok(self.store.latest(case_id)?.map(|r| r.status))
    }

    pub fn get_progress(&self, case_id: &str) -> Result<CaseProgress> {
        let records = self.store.list_cases()?;
        Ok(progress_of(&records, case_id, self.running_progress))
    }

    /// Last `max_chars` characters of the case log (default from config).
    /// `None` when no log has been written yet.
    pub fn get_log_tail(&self, case_id: &str, max_chars: Option<usize>) -> Result<Option<String>> {
        let limit = max_chars.unwrap_or(self.log_tail_chars);
        let Some(text) = read_log(&self.store.log_path(case_id))? else {
            return Ok(None);
        };
        Ok(Some(tail_chars(&text, limit)))
    }

    pub fn list_cases(&self) -> Result<Vec<CaseRecord>> {
        self.store.list_cases()
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for record in self.store.list_cases()? {
            match record.status {
                CaseStatus::Waiting => counts.waiting += 1,
                CaseStatus::Running => counts.running += 1,
                CaseStatus::Done => counts.done += 1,
                CaseStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

fn progress_of(records: &[CaseRecord], case_id: &str, running_progress: u8) -> CaseProgress {
    let Some(record) = records.iter().rev().find(|r| r.case_id == case_id) else {
        return CaseProgress {
            case_id: case_id.to_string(),
            status: None,
            percent: 100,
            message: "not in queue".to_string(),
            elapsed_secs: None,
        };
    };
    let elapsed_secs = record.started_at.map(|start| {
        let end = record.finished_at.unwrap_or_else(Utc::now);
        (end - start).num_seconds().max(0)
    });
    let (percent, message) = match record.status {
        CaseStatus::Done => (100, "done".to_string()),
        CaseStatus::Failed => (
            100,
            format!("failed: {}", record.failure.as_deref().unwrap_or("unknown")),
        ),
        CaseStatus::Running => (running_progress, "running".to_string()),
        CaseStatus::Waiting => {
            let live: Vec<&CaseRecord> = records.iter().filter(|r| !r.status.is_terminal()).collect();
            let total = live.len().max(1);
            let ahead = live
                .iter()
                .position(|r| r.case_id == case_id)
                .unwrap_or(0);
            let percent = (ahead * 100 / total).min(running_progress.saturating_sub(1) as usize) as u8;
            (
                percent,
                format!("queued (position {} of {})", ahead + 1, total),
            )
        }
    };
    CaseProgress {
        case_id: case_id.to_string(),
        status: Some(record.status),
        percent,
        message,
        elapsed_secs,
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}
