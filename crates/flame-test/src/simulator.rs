//! Simulated consortium transport
//!
//! `ScriptedTransport` delivers envelopes straight to in-process executors,
//! passing every request attempt through `Chaos` first. Every envelope it
//! handles is written to a dispatch log, stamped with the run's last
//! recorded sequence number at the moment of dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use flame_core::{NodeId, RoundNumber, RunId, Seq};
use flame_runtime::{Invocation, NodeExecutor};
use flame_transport::{Transport, TransportError};
use flame_wire::{Envelope, MessageKind, ResultBody};

use crate::{Chaos, ChaosConfig, ChaosStats, Fault, FaultScript};

/// Reports the last recorded sequence number of a run
pub type SeqObserver = Arc<dyn Fn(&RunId) -> Seq + Send + Sync>;

/// One envelope seen by the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub run_id: RunId,
    pub round: RoundNumber,
    pub node: NodeId,
    pub kind: MessageKind,
    /// Run's last sequence number when the envelope was dispatched
    pub head_seq: Seq,
}

struct SimNode {
    executor: Arc<dyn NodeExecutor>,
    reachable: bool,
}

/// In-process transport with scripted and random faults
pub struct ScriptedTransport {
    nodes: RwLock<HashMap<NodeId, SimNode>>,
    chaos: Mutex<Chaos>,
    log: Mutex<Vec<DispatchRecord>>,
    observer: RwLock<Option<SeqObserver>>,
}

impl ScriptedTransport {
    pub fn new(config: ChaosConfig, script: FaultScript) -> Self {
        ScriptedTransport {
            nodes: RwLock::new(HashMap::new()),
            chaos: Mutex::new(Chaos::new(config, script)),
            log: Mutex::new(Vec::new()),
            observer: RwLock::new(None),
        }
    }

    /// Add a node served by `executor`
    pub fn add_node(&self, node: NodeId, executor: Arc<dyn NodeExecutor>) {
        self.nodes.write().insert(
            node,
            SimNode {
                executor,
                reachable: true,
            },
        );
    }

    /// Make a node unreachable (or reachable again)
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(sim) = self.nodes.write().get_mut(node) {
            sim.reachable = reachable;
        }
    }

    pub fn set_observer(&self, observer: SeqObserver) {
        *self.observer.write() = Some(observer);
    }

    /// Queue faults for `node` in `round`
    pub fn script(&self, node: &NodeId, round: RoundNumber, faults: impl IntoIterator<Item = Fault>) {
        self.chaos.lock().script_mut().push(node, round, faults);
    }

    pub fn chaos_stats(&self) -> ChaosStats {
        self.chaos.lock().stats().clone()
    }

    /// Everything dispatched so far, in order
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.log.lock().clone()
    }

    /// Input dispatches for one run
    pub fn inputs(&self, run_id: &RunId) -> Vec<DispatchRecord> {
        self.log
            .lock()
            .iter()
            .filter(|record| record.run_id == *run_id && record.kind == MessageKind::Input)
            .cloned()
            .collect()
    }

    fn record(&self, node: &NodeId, envelope: &Envelope) {
        let head_seq = match self.observer.read().as_ref() {
            Some(observer) => observer(&envelope.run_id),
            None => 0,
        };
        self.log.lock().push(DispatchRecord {
            run_id: envelope.run_id.clone(),
            round: envelope.round,
            node: node.clone(),
            kind: envelope.kind,
            head_seq,
        });
    }

    fn node(&self, node: &NodeId) -> Result<Arc<dyn NodeExecutor>, TransportError> {
        let nodes = self.nodes.read();
        let sim = nodes
            .get(node)
            .ok_or_else(|| TransportError::UnknownNode(node.clone()))?;
        if !sim.reachable {
            return Err(TransportError::Disconnected { node: node.clone() });
        }
        Ok(Arc::clone(&sim.executor))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, node: &NodeId) -> Result<(), TransportError> {
        self.node(node).map(|_| ())
    }

    async fn request(
        &self,
        node: &NodeId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        self.record(node, &envelope);
        let executor = self.node(node)?;
        let fault = self.chaos.lock().next_fault(node, envelope.round);

        let body = match fault {
            Some(Fault::Timeout) => {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout { node: node.clone() });
            }
            Some(Fault::Disconnect) => {
                return Err(TransportError::Disconnected { node: node.clone() })
            }
            Some(Fault::Stall) => std::future::pending().await,
            Some(Fault::Delay(delay)) if delay >= timeout => {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout { node: node.clone() });
            }
            Some(Fault::PluginFailure { kind, detail }) => ResultBody::Failure { kind, detail },
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                execute(executor.as_ref(), &envelope).await
            }
            None => execute(executor.as_ref(), &envelope).await,
        };

        Envelope::result(envelope.run_id.clone(), envelope.round, &body).map_err(|e| {
            TransportError::Encoding {
                node: node.clone(),
                detail: e.to_string(),
            }
        })
    }

    async fn notify(&self, node: &NodeId, envelope: Envelope) -> Result<(), TransportError> {
        self.record(node, &envelope);
        self.node(node).map(|_| ())
    }
}

async fn execute(executor: &dyn NodeExecutor, envelope: &Envelope) -> ResultBody {
    let invocation = match Invocation::from_envelope(envelope) {
        Ok(invocation) => invocation,
        Err(e) => {
            return ResultBody::Failure {
                kind: flame_core::FailureKind::MalformedOutput,
                detail: e.to_string(),
            }
        }
    };
    match executor.execute(&invocation).await {
        Ok(output) => ResultBody::Success { output },
        Err(failure) => failure.into(),
    }
}
