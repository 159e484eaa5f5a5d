//! In-process channel transport
//!
//! Each registered node gets a bounded mpsc queue of encoded envelopes.
//! Requests carry a oneshot for the reply. Dropping the node's endpoint is
//! observed by the sender as a disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use flame_core::{FlameResult, NodeId};
use flame_wire::Envelope;

use crate::{Transport, TransportError};

/// Channel transport configuration
#[derive(Clone, Debug)]
pub struct ChannelTransportConfig {
    /// Per-node inbound queue depth
    pub queue_depth: usize,
}

impl Default for ChannelTransportConfig {
    fn default() -> Self {
        ChannelTransportConfig { queue_depth: 64 }
    }
}

impl ChannelTransportConfig {
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

struct Delivery {
    bytes: Bytes,
    reply: Option<oneshot::Sender<Bytes>>,
}

/// A decoded message delivered to a node
pub struct Inbound {
    pub envelope: Envelope,
    reply: Option<oneshot::Sender<Bytes>>,
}

impl Inbound {
    /// Whether the sender is waiting for a reply
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Reply to a request. A sender that stopped waiting is not an error.
    pub fn respond(self, envelope: &Envelope) -> FlameResult<()> {
        let bytes = envelope.encode()?;
        if let Some(reply) = self.reply {
            let _ = reply.send(bytes);
        }
        Ok(())
    }
}

/// Node side of the channel transport
pub struct NodeEndpoint {
    node: NodeId,
    rx: mpsc::Receiver<Delivery>,
}

impl NodeEndpoint {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Next message; `None` once the transport drops this node's route
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let delivery = self.rx.recv().await?;
            match Envelope::decode(&delivery.bytes) {
                Ok(envelope) => {
                    return Some(Inbound {
                        envelope,
                        reply: delivery.reply,
                    })
                }
                Err(e) => {
                    tracing::warn!(node = %self.node, "dropping undecodable envelope: {}", e);
                }
            }
        }
    }
}

/// In-process transport routing envelopes over tokio channels
#[derive(Clone)]
pub struct ChannelTransport {
    routes: Arc<RwLock<HashMap<NodeId, mpsc::Sender<Delivery>>>>,
    config: ChannelTransportConfig,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        ChannelTransport::new(ChannelTransportConfig::default())
    }
}

impl ChannelTransport {
    pub fn new(config: ChannelTransportConfig) -> Self {
        ChannelTransport {
            routes: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register a node, replacing any previous endpoint
    pub fn register(&self, node: impl Into<NodeId>) -> NodeEndpoint {
        let node = node.into();
        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        self.routes.write().insert(node.clone(), tx);
        NodeEndpoint { node, rx }
    }

    /// Drop a node's route; its endpoint sees the end of its stream
    pub fn disconnect(&self, node: &NodeId) {
        self.routes.write().remove(node);
    }

    pub fn is_registered(&self, node: &NodeId) -> bool {
        self.routes.read().contains_key(node)
    }

    fn route(&self, node: &NodeId) -> Result<mpsc::Sender<Delivery>, TransportError> {
        let routes = self.routes.read();
        let tx = routes
            .get(node)
            .ok_or_else(|| TransportError::UnknownNode(node.clone()))?;
        if tx.is_closed() {
            return Err(TransportError::Disconnected { node: node.clone() });
        }
        Ok(tx.clone())
    }

    fn encode(node: &NodeId, envelope: &Envelope) -> Result<Bytes, TransportError> {
        envelope.encode().map_err(|e| TransportError::Encoding {
            node: node.clone(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, node: &NodeId) -> Result<(), TransportError> {
        self.route(node).map(|_| ())
    }

    async fn request(
        &self,
        node: &NodeId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let bytes = Self::encode(node, &envelope)?;
        let tx = self.route(node)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let disconnected = || TransportError::Disconnected { node: node.clone() };

        let exchange = async {
            tx.send(Delivery {
                bytes,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| disconnected())?;
            reply_rx.await.map_err(|_| disconnected())
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout { node: node.clone() })??;

        Envelope::decode(&reply).map_err(|e| TransportError::Encoding {
            node: node.clone(),
            detail: e.to_string(),
        })
    }

    async fn notify(&self, node: &NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let bytes = Self::encode(node, &envelope)?;
        let tx = self.route(node)?;
        tx.send(Delivery { bytes, reply: None })
            .await
            .map_err(|_| TransportError::Disconnected { node: node.clone() })
    }
}
