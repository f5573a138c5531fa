// Error types shared by providers, the merge engine and the job scheduler

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobKind;
use crate::models::SourceId;

/// Failure reported by a provider. "Not found" is not an error: fetchers
/// return `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{provider} rejected the request: credentials missing or expired")]
    Unauthorized { provider: SourceId },

    #[error("{provider} is throttling requests")]
    Throttled {
        provider: SourceId,
        retry_after: Option<Duration>,
    },

    #[error("{provider} request failed: {message}")]
    Other { provider: SourceId, message: String },
}

impl FetchError {
    pub fn other(provider: SourceId, err: impl std::fmt::Display) -> Self {
        FetchError::Other {
            provider,
            message: err.to_string(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, FetchError::Throttled { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no provider returned data for {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {0} does not take work items")]
    NotBatch(Uuid),

    #[error("{item} cannot be queued on a {kind} job")]
    WrongItem { kind: JobKind, item: String },

    #[error("job {0} has drained its queue")]
    Closed(Uuid),

    #[error("job rejected at submission: {0}")]
    Rejected(String),

    #[error("job descriptor file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job descriptor encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
