//! Error types for run orchestration

use thiserror::Error;

use crate::{ConsortiumId, FailureKind, NodeId, RoundNumber, RunId, RunStatus};

/// Core orchestration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlameError {
    // Request errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict on run {run_id}: {reason}")]
    Conflict { run_id: RunId, reason: String },

    #[error("Unauthorized: {caller} does not own consortium {consortium}")]
    Unauthorized {
        caller: NodeId,
        consortium: ConsortiumId,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Consortium not found: {0}")]
    ConsortiumNotFound(ConsortiumId),

    #[error("Run already exists: {0}")]
    RunExists(RunId),

    // Run-level failures
    #[error("Provisioning failed for run {run_id}: {reason}")]
    Provisioning { run_id: RunId, reason: String },

    #[error("Quorum lost for run {run_id}: {active} active, {required} required")]
    QuorumLost {
        run_id: RunId,
        active: usize,
        required: usize,
    },

    #[error("Run {0} was cancelled")]
    RunCancelled(RunId),

    #[error("Run {run_id} reached the round limit of {limit}")]
    RoundLimitExceeded { run_id: RunId, limit: RoundNumber },

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    // Node-level failures
    #[error("Transport timeout talking to {node}")]
    TransportTimeout { node: NodeId },

    #[error("Transport disconnected from {node}")]
    TransportDisconnect { node: NodeId },

    #[error("Plugin failure on {node} ({kind}): {detail}")]
    PluginFailure {
        node: NodeId,
        kind: FailureKind,
        detail: String,
    },

    // Registry errors
    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Round ordering violated for run {run_id}: {reason}")]
    RoundOrdering { run_id: RunId, reason: String },

    #[error("Lease for run {run_id} is held by {holder}")]
    LeaseConflict { run_id: RunId, holder: String },

    #[error("Lease for run {0} expired or was not presented")]
    LeaseExpired(RunId),

    // Encoding / storage
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl FlameError {
    /// Stable machine-readable code for external callers
    pub fn code(&self) -> &'static str {
        match self {
            FlameError::Validation(_) => "VALIDATION",
            FlameError::Conflict { .. } => "CONFLICT",
            FlameError::Unauthorized { .. } => "UNAUTHORIZED",
            FlameError::RunNotFound(_) => "RUN_NOT_FOUND",
            FlameError::ConsortiumNotFound(_) => "CONSORTIUM_NOT_FOUND",
            FlameError::RunExists(_) => "RUN_EXISTS",
            FlameError::Provisioning { .. } => "PROVISIONING",
            FlameError::QuorumLost { .. } => "QUORUM_LOST",
            FlameError::RunCancelled(_) => "RUN_CANCELLED",
            FlameError::RoundLimitExceeded { .. } => "ROUND_LIMIT_EXCEEDED",
            FlameError::Aggregation(_) => "AGGREGATION",
            FlameError::TransportTimeout { .. } => "TRANSPORT_TIMEOUT",
            FlameError::TransportDisconnect { .. } => "TRANSPORT_DISCONNECT",
            FlameError::PluginFailure { .. } => "PLUGIN_FAILURE",
            FlameError::InvalidTransition { .. } => "INVALID_TRANSITION",
            FlameError::RoundOrdering { .. } => "ROUND_ORDERING",
            FlameError::LeaseConflict { .. } => "LEASE_CONFLICT",
            FlameError::LeaseExpired(_) => "LEASE_EXPIRED",
            FlameError::InvalidWireFormat(_) => "INVALID_WIRE_FORMAT",
            FlameError::Storage(_) => "STORAGE",
        }
    }

    /// Node-level failures that the retry budget covers
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlameError::TransportTimeout { .. } | FlameError::TransportDisconnect { .. }
        )
    }
}

impl From<std::io::Error> for FlameError {
    fn from(err: std::io::Error) -> Self {
        FlameError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FlameError {
    fn from(err: serde_json::Error) -> Self {
        FlameError::InvalidWireFormat(err.to_string())
    }
}

/// Result type for orchestration operations
pub type FlameResult<T> = Result<T, FlameError>;
