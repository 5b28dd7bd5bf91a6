//! Error kinds surfaced by the limiter, evaluator and case runners.
//!
//! Orchestration code works in `anyhow::Result`; callers that need to branch on
//! a kind recover it with `err.downcast_ref::<Error>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The case already has a non-terminal queue entry.
    #[error("duplicate_submission: case {case_id} is already waiting or running")]
    DuplicateSubmission { case_id: String },

    /// The active-case cap is reached; the caller must queue or retry later.
    #[error("admission_rejected: overloaded, {active} of {max_cases} case slots in use (case {case_id})")]
    AdmissionRejected {
        case_id: String,
        active: usize,
        max_cases: usize,
    },

    #[error("evaluation_failed: case {case_id}: {message}")]
    EvaluationFailed { case_id: String, message: String },

    #[error("stage_failed: case {case_id}: stage {stage} exited with {exit}")]
    StageFailed {
        case_id: String,
        stage: String,
        exit: String,
    },

    /// A release without a matching reservation. The fairness accounting can no
    /// longer be trusted, so the owning case must stop.
    #[error("ledger_invariant_violation: case {case_id}: {detail}")]
    LedgerInvariantViolation { case_id: String, detail: String },

    #[error("dispatcher_protocol: {0}")]
    DispatcherProtocol(String),

    #[error("invalid_config: {0}")]
    Config(String),
}

impl Error {
    /// Stable snake_case code used in JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DuplicateSubmission { .. } => "duplicate_submission",
            Error::AdmissionRejected { .. } => "admission_rejected",
            Error::EvaluationFailed { .. } => "evaluation_failed",
            Error::StageFailed { .. } => "stage_failed",
            Error::LedgerInvariantViolation { .. } => "ledger_invariant_violation",
            Error::DispatcherProtocol(_) => "dispatcher_protocol",
            Error::Config(_) => "invalid_config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_message_prefixes() {
        let errs = vec![
            Error::DuplicateSubmission {
                case_id: "a".to_string(),
            },
            Error::AdmissionRejected {
                case_id: "a".to_string(),
                active: 10,
                max_cases: 10,
            },
            Error::StageFailed {
                case_id: "a".to_string(),
                stage: "fit_3".to_string(),
                exit: "1".to_string(),
            },
            Error::LedgerInvariantViolation {
                case_id: "a".to_string(),
                detail: "free without reserve".to_string(),
            },
            Error::EvaluationFailed {
                case_id: "a".to_string(),
                message: "solver diverged".to_string(),
            },
            Error::DispatcherProtocol("no job_id".to_string()),
            Error::Config("limits.ports must be positive".to_string()),
        ];
        for err in errs {
            assert!(
                err.to_string().starts_with(err.code()),
                "message should lead with its code: {}",
                err
            );
        }
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = Error::EvaluationFailed {
            case_id: "c".to_string(),
            message: "boom".to_string(),
        }
        .into();
        match err.downcast_ref::<Error>() {
            Some(Error::EvaluationFailed { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected downcast: {:?}", other),
        }
    }
}
