//! Transport trait

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use flame_core::NodeId;
use flame_wire::Envelope;

use crate::TransportError;

/// Bidirectional, addressable channel from the coordinator to each node.
///
/// Delivery is ordered per (run, node) pair. Implementations must report
/// timeouts and disconnects as errors instead of dropping messages silently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Probe that a node is reachable
    async fn connect(&self, node: &NodeId) -> Result<(), TransportError>;

    /// Send an envelope and wait up to `timeout` for the node's reply
    async fn request(
        &self,
        node: &NodeId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError>;

    /// Send an envelope without waiting for a reply
    async fn notify(&self, node: &NodeId, envelope: Envelope) -> Result<(), TransportError>;
}

/// Shared transport handle
pub type SharedTransport = Arc<dyn Transport>;
