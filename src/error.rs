//! Error taxonomy for the export pipeline.
//!
//! Every stage returns [`PipelineError`]. Callers decide what to do with an error
//! by its class rather than its message:
//!
//! - [`PipelineError::is_retriable`]: transient storage/network failures, timeouts and
//!   the missing-chunk race at merge time. Retried with a [`RetryPolicy`](crate::pipeline::RetryPolicy).
//! - [`PipelineError::is_conflict`]: another attempt holds the claim. Treated as a no-op.
//! - everything else is terminal for the chunk or scenario it concerns.

use std::time::Duration;

/// Result alias used by the pipeline stages.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors produced by pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed chunk, payload, identifier or metadata. Never retried.
    #[error("validation failed for {key}: {message}")]
    Validation { key: String, message: String },

    /// Storage call failed in a way that may succeed on retry.
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// Network call to an external destination failed in a way that may succeed on retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A storage or network call exceeded its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// Another attempt holds the claim (or already finished the work).
    #[error("coordination conflict on {key}: {detail}")]
    Conflict { key: String, detail: String },

    /// A chunk listed in the manifest had no spatialized output at merge time.
    #[error("scenario {scenario_id} is missing spatialized chunk {chunk_id}")]
    MissingChunk { scenario_id: String, chunk_id: String },

    /// Spatialized data is inconsistent; requires manual intervention.
    #[error("aggregation failed for scenario {scenario_id}: {message}")]
    FatalAggregation { scenario_id: String, message: String },

    /// All export attempts failed.
    #[error("export of scenario {scenario_id} failed after {attempts} attempts: {last_error}")]
    ExportExhausted {
        scenario_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The record is not in a state that permits the requested operation.
    #[error("scenario {scenario_id} is {actual}, expected {expected}")]
    InvalidState {
        scenario_id: String,
        expected: String,
        actual: String,
    },

    /// A blocking compute task panicked or was cancelled before finishing.
    #[error("{task} did not finish: {message}")]
    TaskFailed { task: String, message: String },

    /// A required record or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored record could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Build a validation error for the given key.
    pub fn validation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Build a coordination conflict for the given key.
    pub fn conflict(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// Wrap a failed `spawn_blocking` join.
    pub fn task_failed(task: impl Into<String>, err: tokio::task::JoinError) -> Self {
        let message = if err.is_panic() { "panicked" } else { "cancelled" };
        Self::TaskFailed {
            task: task.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failed operation may be attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage(_)
                | Self::TransientNetwork(_)
                | Self::Timeout { .. }
                | Self::MissingChunk { .. }
        )
    }

    /// Whether this is a claim conflict, which callers treat as a no-op.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short machine-readable class name, used in logs and failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::TransientStorage(_) => "transient_storage",
            Self::TransientNetwork(_) => "transient_network",
            Self::Timeout { .. } => "timeout",
            Self::Conflict { .. } => "conflict",
            Self::MissingChunk { .. } => "missing_chunk",
            Self::FatalAggregation { .. } => "fatal_aggregation",
            Self::ExportExhausted { .. } => "export_exhausted",
            Self::InvalidState { .. } => "invalid_state",
            Self::TaskFailed { .. } => "task_failed",
            Self::NotFound(_) => "not_found",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<object_store::Error> for PipelineError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => {
                Self::conflict(path, "object already exists")
            }
            object_store::Error::Precondition { path, .. } => {
                Self::conflict(path, "object changed concurrently")
            }
            other => Self::TransientStorage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(PipelineError::TransientStorage("503".into()).is_retriable());
        assert!(PipelineError::TransientNetwork("reset".into()).is_retriable());
        assert!(PipelineError::Timeout {
            operation: "put".into(),
            elapsed: Duration::from_secs(1),
        }
        .is_retriable());
        assert!(PipelineError::MissingChunk {
            scenario_id: "s".into(),
            chunk_id: "c".into(),
        }
        .is_retriable());

        assert!(!PipelineError::validation("c1", "bad payload").is_retriable());
        assert!(!PipelineError::conflict("s", "held").is_retriable());
        assert!(!PipelineError::FatalAggregation {
            scenario_id: "s".into(),
            message: "bad row".into(),
        }
        .is_retriable());
    }

    #[test]
    fn test_conflict_is_not_retriable() {
        let err = PipelineError::conflict("manifests/s1.json", "merge already claimed");
        assert!(err.is_conflict());
        assert_eq!(err.kind(), "conflict");
        assert!(err.to_string().contains("merge already claimed"));
    }

    #[test]
    fn test_object_store_not_found_maps_to_not_found() {
        let err: PipelineError = object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::NotFound(ref p) if p == "a/b"));
    }

    #[test]
    fn test_object_store_generic_maps_to_transient() {
        let err: PipelineError = object_store::Error::Generic {
            store: "S3",
            source: "connection reset".into(),
        }
        .into();
        assert!(err.is_retriable());
    }
}
