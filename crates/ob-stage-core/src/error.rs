use thiserror::Error;

/// Errors raised by reconciliation and action execution.
///
/// Validation and not-found errors are normally caught at single-action or
/// single-instance granularity and turned into result details; only the
/// primary-path loads let them escape.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("failed to persist progress for onboarding {onboarding_id}: typed write: {typed}; raw write: {raw}")]
    Persistence {
        onboarding_id: i64,
        typed: String,
        raw: String,
    },

    #[error("workflow {workflow_id} sync incomplete: {failed} of {} instance(s) failed", .synced + .failed)]
    PartialBatch {
        workflow_id: i64,
        synced: usize,
        failed: usize,
    },

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl StageError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Short category name, used in audit events and result details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Parse(_) => "ParseError",
            Self::Persistence { .. } => "PersistenceError",
            Self::PartialBatch { .. } => "PartialBatchFailure",
            Self::Store(_) => "StoreError",
        }
    }
}

pub type Result<T> = std::result::Result<T, StageError>;
