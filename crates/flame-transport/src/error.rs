//! Transport errors

use thiserror::Error;

use flame_core::{FailureKind, FlameError, NodeId};

/// Failure to exchange a message with a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Timed out waiting for {node}")]
    Timeout { node: NodeId },

    #[error("Disconnected from {node}")]
    Disconnected { node: NodeId },

    #[error("No route to {0}")]
    UnknownNode(NodeId),

    #[error("Undecodable message from {node}: {detail}")]
    Encoding { node: NodeId, detail: String },
}

impl TransportError {
    /// Timeouts and lost connections may succeed on retry
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Encoding { .. })
    }

    /// How this failure is recorded against the node
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout { .. } => FailureKind::TransportTimeout,
            TransportError::Disconnected { .. } | TransportError::UnknownNode(_) => {
                FailureKind::TransportDisconnect
            }
            TransportError::Encoding { .. } => FailureKind::MalformedOutput,
        }
    }
}

impl From<TransportError> for FlameError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { node } => FlameError::TransportTimeout { node },
            TransportError::Disconnected { node } | TransportError::UnknownNode(node) => {
                FlameError::TransportDisconnect { node }
            }
            TransportError::Encoding { detail, .. } => FlameError::InvalidWireFormat(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let node = NodeId::new("site-a");
        let timeout = TransportError::Timeout { node: node.clone() };
        assert!(timeout.is_transient());
        assert_eq!(timeout.failure_kind(), FailureKind::TransportTimeout);
        assert_eq!(FlameError::from(timeout).code(), "TRANSPORT_TIMEOUT");

        let unknown = TransportError::UnknownNode(node.clone());
        assert_eq!(unknown.failure_kind(), FailureKind::TransportDisconnect);

        let garbled = TransportError::Encoding {
            node,
            detail: "eof".into(),
        };
        assert!(!garbled.is_transient());
    }
}
