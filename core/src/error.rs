//! Error types for EngineLink

use crate::types::{TransactionId, Version};
use std::fmt;
use thiserror::Error;

/// What a `NotFound` error failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Entry,
    State,
    Transaction,
    Snapshot,
    Path,
    Subscription,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotFoundKind::Entry => "entry",
            NotFoundKind::State => "state",
            NotFoundKind::Transaction => "transaction",
            NotFoundKind::Snapshot => "snapshot",
            NotFoundKind::Path => "path",
            NotFoundKind::Subscription => "subscription",
        };
        f.write_str(name)
    }
}

/// Main error type for EngineLink
#[derive(Error, Debug)]
pub enum BridgeError {
    // ============ Lookup Errors ============
    #[error("{kind} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },

    // ============ Capacity Errors ============
    #[error("Capacity exceeded for {resource}: limit {limit}")]
    CapacityExceeded { resource: &'static str, limit: usize },

    // ============ Concurrency Errors ============
    #[error("Version conflict on {state_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        state_id: String,
        expected: Version,
        actual: Version,
    },

    #[error("Invalid transaction {id}: {reason}")]
    InvalidTransaction { id: TransactionId, reason: String },

    #[error("State already exists: {0}")]
    DuplicateState(String),

    // ============ Patch Errors ============
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ============ Runtime Errors ============
    #[error("Scheduler requires a running tokio runtime")]
    SchedulerUnavailable,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
        BridgeError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_transaction(id: TransactionId, reason: impl Into<String>) -> Self {
        BridgeError::InvalidTransaction {
            id,
            reason: reason.into(),
        }
    }

    /// Coarse classification used by the transport boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NotFound { .. } => ErrorKind::NotFound,
            BridgeError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            BridgeError::VersionConflict { .. } => ErrorKind::VersionConflict,
            BridgeError::InvalidTransaction { .. } => ErrorKind::InvalidTransaction,
            BridgeError::DuplicateState(_) => ErrorKind::DuplicateState,
            BridgeError::InvalidOperation(_) | BridgeError::InvalidPath(_) => {
                ErrorKind::InvalidRequest
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Only stale-version rejections are worth resubmitting after a refetch
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::VersionConflict { .. })
    }
}

/// Error classification surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    CapacityExceeded,
    VersionConflict,
    InvalidTransaction,
    DuplicateState,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code for the transport layer
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::VersionConflict | ErrorKind::DuplicateState => 409,
            ErrorKind::InvalidTransaction => 410,
            ErrorKind::CapacityExceeded => 429,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::SerializationError(err.to_string())
    }
}
