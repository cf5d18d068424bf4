use crate::checkpoint::CheckpointError;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

/// Normalized failure classes for collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    RateLimited,
    UpstreamUnavailable,
    Unauthorized,
    NotFound,
    MalformedResponse,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::MalformedResponse => "malformed_response",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

/// Failure of an event source or page source query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} source failure: {message}", .kind.as_str())]
pub struct SourceError {
    pub kind: FailureKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Network
                | FailureKind::RateLimited
                | FailureKind::UpstreamUnavailable
                | FailureKind::Timeout
        )
    }
}

/// Failure reported by a script's handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler failure: {message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<SourceError> for HandlerError {
    fn from(err: SourceError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("batch `{label}` failed: {source}")]
    Batch {
        label: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{operation} exceeded timeout of {limit:?}")]
    OperationTimeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("item `{0}` not found")]
    ItemNotFound(String),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] JoinError),

    #[error("Orchestration error: {0}")]
    Orchestration(String),
}
