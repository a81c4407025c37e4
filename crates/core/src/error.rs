use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{TransferChannel, TransferState};
use crate::pipeline::PipelineStage;

/// Failure reported by a remote service contract implementation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }

    /// Worth asking again: the resource exists and we may see it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Unauthorized(_) | ServiceError::NotFound(_))
    }
}

/// Capture failure taxonomy.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("authorization failed for {resource}: {source}")]
    Authorization {
        resource: String,
        #[source]
        source: ServiceError,
    },

    #[error("snapshot {snapshot} could not be created: {source}")]
    SnapshotCreation {
        snapshot: String,
        #[source]
        source: ServiceError,
    },

    #[error("{channel} copy of {snapshot} did not finish within {timeout:?}")]
    TransferTimeout {
        snapshot: String,
        channel: TransferChannel,
        timeout: Duration,
    },

    #[error("{channel} copy of {snapshot} failed: {reason}")]
    TransferFailed {
        snapshot: String,
        channel: TransferChannel,
        reason: String,
    },

    #[error("digest of {path} could not be computed: {reason}")]
    HashComputation { path: String, reason: String },

    #[error("secret {vault}/{name} not found")]
    SecretNotFound { vault: String, name: String },

    #[error("cleanup step '{step}' failed for {snapshot}: {reason}")]
    Cleanup {
        snapshot: String,
        step: &'static str,
        reason: String,
    },

    #[error("malformed encryption key reference '{0}'")]
    InvalidKeyRef(String),

    #[error("access grant duration {0:?} is out of range")]
    GrantDuration(Duration),

    #[error("illegal transfer transition {from:?} -> {to:?} for {snapshot}")]
    IllegalTransition {
        snapshot: String,
        from: TransferState,
        to: TransferState,
    },

    #[error("{context}: {source}")]
    Service {
        context: String,
        #[source]
        source: ServiceError,
    },
}

impl CaptureError {
    pub fn service(context: impl Into<String>, source: ServiceError) -> Self {
        CaptureError::Service {
            context: context.into(),
            source,
        }
    }

    /// Short machine-friendly name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Authorization { .. } => "authorization",
            CaptureError::SnapshotCreation { .. } => "snapshot_creation",
            CaptureError::TransferTimeout { .. } => "transfer_timeout",
            CaptureError::TransferFailed { .. } => "transfer_failed",
            CaptureError::HashComputation { .. } => "hash_computation",
            CaptureError::SecretNotFound { .. } => "secret_not_found",
            CaptureError::Cleanup { .. } => "cleanup",
            CaptureError::InvalidKeyRef(_) => "invalid_key_ref",
            CaptureError::GrantDuration(_) => "grant_duration",
            CaptureError::IllegalTransition { .. } => "illegal_transition",
            CaptureError::Service { .. } => "service",
        }
    }
}

/// A capture error with the disk identity and failing stage attached.
#[derive(Debug, Error)]
#[error("disk {disk} failed while {stage}: {error}")]
pub struct DiskFailure {
    pub disk: String,
    pub stage: PipelineStage,
    #[source]
    pub error: CaptureError,
}

/// Serializable view of a failure, for reports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureSummary {
    pub stage: PipelineStage,
    pub kind: String,
    pub message: String,
}

impl From<&DiskFailure> for FailureSummary {
    fn from(f: &DiskFailure) -> Self {
        Self {
            stage: f.stage,
            kind: f.error.kind().to_string(),
            message: f.error.to_string(),
        }
    }
}
