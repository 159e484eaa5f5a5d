//! Round coordinator
//!
//! One coordinator task drives one run, a round at a time:
//! 1. Renew the lease and record `RoundStarted`
//! 2. Fan the input out to every active node (one attempt task per node)
//! 3. Join on node signals, the round deadline and the cancel signal
//! 4. Retry transient failures, exclude nodes that fail for good
//! 5. Enforce quorum, combine, then advance or finalize
//!
//! Each node moves through `Pending -> Retrying(n) -> Success | Excluded`.
//! Exclusion is permanent for the rest of the run. Signals from nodes that
//! already settled, or that arrive after the round closed, are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use flame_core::{
    FailureKind, FlameError, FlameResult, ImageRef, NodeId, NodeResult, Payload, RoundDecision,
    RoundNumber, RunEvent, RunId, RunStatus,
};
use flame_registry::{EventStore, RunLease, RunRegistry};
use flame_transport::{RetryPolicy, SharedTransport};
use flame_wire::{Envelope, InputBody, ResultBody};

use crate::{fmt_duration, Aggregator, Combined, OrchestratorConfig};

/// What a coordinator needs to know about its run
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub image: ImageRef,
    pub parameters: Payload,
    /// Nodes still taking part
    pub active: BTreeSet<NodeId>,
    /// Minimum active nodes for the run to continue
    pub quorum: usize,
    pub aggregator: Aggregator,
}

/// Per-node state within a round
#[derive(Clone, Debug, PartialEq)]
pub enum NodeState {
    Pending,
    /// Retrying after `n` failed attempts
    Retrying(u32),
    Success(Payload),
    Excluded(FailureKind),
}

impl NodeState {
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, NodeState::Success(_) | NodeState::Excluded(_))
    }
}

/// Coordinator statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub rounds: u64,
    pub retries: u64,
    pub exclusions: u64,
    /// Signals ignored because the node had already settled
    pub late_signals: u64,
}

/// How a coordinator finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub status: RunStatus,
    pub stats: CoordinatorStats,
}

enum NodeSignal {
    Retrying {
        node: NodeId,
        attempt: u32,
        reason: FailureKind,
        detail: String,
    },
    Settled {
        node: NodeId,
        outcome: Result<Payload, (FailureKind, String)>,
    },
}

impl NodeSignal {
    fn node(&self) -> &NodeId {
        match self {
            NodeSignal::Retrying { node, .. } | NodeSignal::Settled { node, .. } => node,
        }
    }
}

enum RoundOutcome {
    Advance(Payload),
    Finished(RunStatus),
}

/// Drives one run's rounds to a terminal state
pub struct RoundCoordinator<S: EventStore> {
    registry: Arc<RunRegistry<S>>,
    transport: SharedTransport,
    config: OrchestratorConfig,
    ctx: RunContext,
    lease: RunLease,
    cancel: watch::Receiver<bool>,
    stats: CoordinatorStats,
}

impl<S: EventStore> RoundCoordinator<S> {
    pub fn new(
        registry: Arc<RunRegistry<S>>,
        transport: SharedTransport,
        config: OrchestratorConfig,
        ctx: RunContext,
        lease: RunLease,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        RoundCoordinator {
            registry,
            transport,
            config,
            ctx,
            lease,
            cancel,
            stats: CoordinatorStats::default(),
        }
    }

    /// Run rounds until the run is terminal.
    ///
    /// An `Err` means the coordinator stopped without finishing the run,
    /// e.g. because its lease was taken over.
    pub async fn run(mut self) -> FlameResult<CoordinatorReport> {
        let mut input = self.ctx.parameters.clone();
        let mut round: RoundNumber = 0;
        loop {
            if *self.cancel.borrow() {
                let status = self.finish_cancelled(None, BTreeMap::new())?;
                return Ok(self.report(status));
            }
            if round >= self.config.max_rounds {
                let err = FlameError::RoundLimitExceeded {
                    run_id: self.ctx.run_id.clone(),
                    limit: self.config.max_rounds,
                };
                let status = self.fail_run(&err)?;
                return Ok(self.report(status));
            }

            match self.registry.renew_lease(&self.lease, self.config.lease_ttl) {
                Ok(lease) => self.lease = lease,
                Err(e) => {
                    tracing::warn!(run_id = %self.ctx.run_id, round, "lease lost, coordinator stopping: {}", e);
                    return Err(e);
                }
            }

            match self.run_round(round, &input).await? {
                RoundOutcome::Advance(next) => {
                    input = next;
                    round += 1;
                }
                RoundOutcome::Finished(status) => return Ok(self.report(status)),
            }
        }
    }

    fn report(&self, status: RunStatus) -> CoordinatorReport {
        CoordinatorReport {
            status,
            stats: self.stats.clone(),
        }
    }

    async fn run_round(&mut self, round: RoundNumber, input: &Payload) -> FlameResult<RoundOutcome> {
        let run_id = self.ctx.run_id.clone();
        let round_deadline = self.config.round_deadline;
        let deadline_at = Instant::now() + round_deadline;
        let deadline = Utc::now()
            + chrono::Duration::from_std(round_deadline)
                .map_err(|e| FlameError::Validation(format!("round deadline: {e}")))?;
        let active: Vec<NodeId> = self.ctx.active.iter().cloned().collect();

        self.record(RunEvent::RoundStarted {
            round,
            input: input.clone(),
            active: active.clone(),
            deadline,
        })?;
        self.stats.rounds += 1;
        tracing::info!(
            run_id = %run_id,
            round,
            active = active.len(),
            deadline = %fmt_duration(round_deadline),
            "round started"
        );

        let body = InputBody {
            image: self.ctx.image.clone(),
            input: input.clone(),
            parameters: (round == 0).then(|| self.ctx.parameters.clone()),
        };
        let envelope = Envelope::input(run_id.clone(), round, &body)?;

        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for node in &active {
            tasks.spawn(attempt_node(
                Arc::clone(&self.transport),
                node.clone(),
                envelope.clone(),
                self.config.attempt_timeout,
                self.config.retry.clone(),
                signal_tx.clone(),
            ));
        }
        drop(signal_tx);

        let mut states: BTreeMap<NodeId, NodeState> = active
            .iter()
            .map(|node| (node.clone(), NodeState::Pending))
            .collect();
        let deadline_timer = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline_timer);
        let mut cancel = self.cancel.clone();

        while states.values().any(|state| !state.is_settled()) {
            tokio::select! {
                biased;

                _ = cancelled(&mut cancel) => {
                    tasks.abort_all();
                    let status = self.finish_cancelled(Some(round), successes(&states))?;
                    return Ok(RoundOutcome::Finished(status));
                }
                _ = &mut deadline_timer => {
                    let detail = format!("no result within {}", fmt_duration(round_deadline));
                    for node in unsettled(&states) {
                        self.exclude(round, &mut states, node, FailureKind::DeadlineExceeded, detail.clone())?;
                    }
                }
                signal = signals.recv() => match signal {
                    Some(signal) => self.on_signal(round, &mut states, signal)?,
                    None => {
                        for node in unsettled(&states) {
                            self.exclude(round, &mut states, node, FailureKind::TransportDisconnect, "attempt ended without a result".into())?;
                        }
                    }
                },
            }

            if self.ctx.active.len() < self.ctx.quorum {
                break;
            }
        }
        tasks.abort_all();

        let results = successes(&states);
        if self.ctx.active.len() < self.ctx.quorum {
            let err = FlameError::QuorumLost {
                run_id,
                active: self.ctx.active.len(),
                required: self.ctx.quorum,
            };
            return self.abort_round(round, results, &err).map(RoundOutcome::Finished);
        }

        let outputs: BTreeMap<NodeId, Payload> = states
            .into_iter()
            .filter_map(|(node, state)| match state {
                NodeState::Success(output) => Some((node, output)),
                _ => None,
            })
            .collect();
        match self.ctx.aggregator.combine_async(input.clone(), outputs, round).await {
            Ok(Combined { next_state, done: true }) => {
                self.record(RunEvent::RoundClosed {
                    round,
                    decision: RoundDecision::Finalize,
                    results,
                })?;
                self.record(RunEvent::RunCompleted { result: next_state })?;
                self.release();
                tracing::info!(run_id = %run_id, round, "run completed");
                Ok(RoundOutcome::Finished(RunStatus::Completed))
            }
            Ok(Combined { next_state, done: false }) => {
                self.record(RunEvent::RoundClosed {
                    round,
                    decision: RoundDecision::Advance,
                    results,
                })?;
                tracing::info!(run_id = %run_id, round, "round closed, advancing");
                Ok(RoundOutcome::Advance(next_state))
            }
            Err(e) => self.abort_round(round, results, &e).map(RoundOutcome::Finished),
        }
    }

    fn on_signal(
        &mut self,
        round: RoundNumber,
        states: &mut BTreeMap<NodeId, NodeState>,
        signal: NodeSignal,
    ) -> FlameResult<()> {
        if states.get(signal.node()).map_or(true, NodeState::is_settled) {
            self.stats.late_signals += 1;
            tracing::debug!(run_id = %self.ctx.run_id, round, node = %signal.node(), "ignoring signal from settled node");
            return Ok(());
        }

        match signal {
            NodeSignal::Retrying {
                node,
                attempt,
                reason,
                detail,
            } => {
                tracing::warn!(
                    run_id = %self.ctx.run_id,
                    round,
                    node = %node,
                    attempt,
                    reason = %reason,
                    "retrying node: {}",
                    detail
                );
                self.record(RunEvent::NodeRetried {
                    round,
                    node: node.clone(),
                    attempt,
                    reason,
                })?;
                self.stats.retries += 1;
                states.insert(node, NodeState::Retrying(attempt));
            }
            NodeSignal::Settled {
                node,
                outcome: Ok(output),
            } => {
                tracing::debug!(run_id = %self.ctx.run_id, round, node = %node, "node succeeded");
                states.insert(node, NodeState::Success(output));
            }
            NodeSignal::Settled {
                node,
                outcome: Err((kind, detail)),
            } => self.exclude(round, states, node, kind, detail)?,
        }
        Ok(())
    }

    fn exclude(
        &mut self,
        round: RoundNumber,
        states: &mut BTreeMap<NodeId, NodeState>,
        node: NodeId,
        kind: FailureKind,
        detail: String,
    ) -> FlameResult<()> {
        tracing::warn!(
            run_id = %self.ctx.run_id,
            round,
            node = %node,
            kind = %kind,
            "node excluded: {}",
            detail
        );
        self.record(RunEvent::NodeExcluded {
            round,
            node: node.clone(),
            kind,
            detail,
        })?;
        self.ctx.active.remove(&node);
        self.stats.exclusions += 1;
        states.insert(node, NodeState::Excluded(kind));
        Ok(())
    }

    /// Close the open round with `Abort` and fail the run with `err`
    fn abort_round(
        &mut self,
        round: RoundNumber,
        results: BTreeMap<NodeId, NodeResult>,
        err: &FlameError,
    ) -> FlameResult<RunStatus> {
        self.record(RunEvent::RoundClosed {
            round,
            decision: RoundDecision::Abort,
            results,
        })?;
        self.fail_run(err)
    }

    fn fail_run(&mut self, err: &FlameError) -> FlameResult<RunStatus> {
        self.record(RunEvent::RunFailed {
            code: err.code().into(),
            reason: err.to_string(),
        })?;
        self.release();
        tracing::error!(run_id = %self.ctx.run_id, code = err.code(), "run failed: {}", err);
        Ok(RunStatus::Failed)
    }

    fn finish_cancelled(
        &mut self,
        open_round: Option<RoundNumber>,
        results: BTreeMap<NodeId, NodeResult>,
    ) -> FlameResult<RunStatus> {
        if let Some(round) = open_round {
            self.send_aborts(round);
            self.record(RunEvent::RoundClosed {
                round,
                decision: RoundDecision::Abort,
                results,
            })?;
        }
        self.record(RunEvent::RunCancelled)?;
        self.release();
        tracing::info!(run_id = %self.ctx.run_id, round = ?open_round, "run cancelled");
        Ok(RunStatus::Cancelled)
    }

    /// Best-effort `abort` to every active node, off the coordinator task
    fn send_aborts(&self, round: RoundNumber) {
        let transport = Arc::clone(&self.transport);
        let run_id = self.ctx.run_id.clone();
        let nodes: Vec<NodeId> = self.ctx.active.iter().cloned().collect();
        tokio::spawn(async move {
            for node in nodes {
                if let Err(e) = transport.notify(&node, Envelope::abort(run_id.clone(), round)).await {
                    tracing::debug!(run_id = %run_id, round, node = %node, "abort not delivered: {}", e);
                }
            }
        });
    }

    fn record(&self, event: RunEvent) -> FlameResult<()> {
        self.registry
            .append_event(&self.ctx.run_id, event, Some(&self.lease))
            .map(|_| ())
    }

    fn release(&self) {
        if !self.registry.release_lease(&self.lease) {
            tracing::debug!(run_id = %self.ctx.run_id, "lease already gone at release");
        }
    }
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn unsettled(states: &BTreeMap<NodeId, NodeState>) -> Vec<NodeId> {
    states
        .iter()
        .filter(|(_, state)| !state.is_settled())
        .map(|(node, _)| node.clone())
        .collect()
}

fn successes(states: &BTreeMap<NodeId, NodeState>) -> BTreeMap<NodeId, NodeResult> {
    states
        .iter()
        .filter_map(|(node, state)| match state {
            NodeState::Success(output) => Some((
                node.clone(),
                NodeResult::Success {
                    output: output.clone(),
                },
            )),
            _ => None,
        })
        .collect()
}

/// Request/retry loop for one node in one round
async fn attempt_node(
    transport: SharedTransport,
    node: NodeId,
    envelope: Envelope,
    timeout: Duration,
    retry: RetryPolicy,
    signals: mpsc::UnboundedSender<NodeSignal>,
) {
    let mut retries = 0;
    loop {
        match transport.request(&node, envelope.clone(), timeout).await {
            Ok(reply) => {
                let outcome = read_reply(&envelope, reply);
                let _ = signals.send(NodeSignal::Settled { node, outcome });
                return;
            }
            Err(e) if e.is_transient() && retry.allows_retry(retries) => {
                let backoff = retry.backoff(retries);
                retries += 1;
                let _ = signals.send(NodeSignal::Retrying {
                    node: node.clone(),
                    attempt: retries,
                    reason: e.failure_kind(),
                    detail: e.to_string(),
                });
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                let outcome = Err((e.failure_kind(), e.to_string()));
                let _ = signals.send(NodeSignal::Settled { node, outcome });
                return;
            }
        }
    }
}

fn read_reply(sent: &Envelope, reply: Envelope) -> Result<Payload, (FailureKind, String)> {
    if reply.run_id != sent.run_id || reply.round != sent.round {
        return Err((
            FailureKind::MalformedOutput,
            format!("reply for run {} round {}", reply.run_id, reply.round),
        ));
    }
    match reply.result_body() {
        Ok(ResultBody::Success { output }) => Ok(output),
        Ok(ResultBody::Failure { kind, detail }) => Err((kind, detail)),
        Err(e) => Err((FailureKind::MalformedOutput, e.to_string())),
    }
}
