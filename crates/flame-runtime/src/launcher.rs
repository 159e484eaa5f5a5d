//! Run launcher
//!
//! Entry point for callers: validates a launch request, creates the run,
//! provisions it and hands it to a `RoundCoordinator` task. Launch is
//! idempotent on the run id: the same request returns the existing run,
//! a different one under the same id is a conflict. The existing run is
//! looked up before the request is checked against the current consortium,
//! so later membership changes do not break relaunching a recorded run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use flame_core::{
    fingerprint, ConsortiumId, FlameError, FlameResult, ImageRef, NodeId, Payload, RoundDecision,
    RoundNumber, Run, RunEvent, RunId, RunStatus,
};
use flame_registry::{EventStore, MemoryEventStore, RunLease, RunRegistry, RunStatusReport};
use flame_transport::SharedTransport;

use crate::{fmt_duration, Aggregator, OrchestratorConfig, RoundCoordinator, RuleCatalog, RunContext};

/// Launch request, as received from the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub run_id: RunId,
    pub consortium_id: ConsortiumId,
    pub image_ref: String,
    pub user_ids: Vec<NodeId>,
    #[serde(default)]
    pub computation_parameters: Payload,
    /// Authenticated caller; must own the consortium when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<NodeId>,
}

impl LaunchRequest {
    pub fn new(
        run_id: impl Into<RunId>,
        consortium_id: impl Into<ConsortiumId>,
        image_ref: impl Into<String>,
        user_ids: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        LaunchRequest {
            run_id: run_id.into(),
            consortium_id: consortium_id.into(),
            image_ref: image_ref.into(),
            user_ids: user_ids.into_iter().collect(),
            computation_parameters: Payload::Object(Default::default()),
            caller: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.computation_parameters = parameters;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<NodeId>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// Launch acknowledgement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Typed error body with a stable code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&FlameError> for ErrorResponse {
    fn from(err: &FlameError) -> Self {
        ErrorResponse {
            code: err.code().into(),
            message: err.to_string(),
        }
    }
}

/// Fields that identify a launch, derived without consulting the registry
struct Identity {
    image: ImageRef,
    members: Vec<NodeId>,
    fingerprint: String,
}

/// Validated launch, ready to be recorded
struct Plan {
    image: ImageRef,
    members: Vec<NodeId>,
    contributors: Vec<NodeId>,
    quorum: usize,
    fingerprint: String,
    aggregator: Aggregator,
}

/// Launches, cancels and awaits runs
pub struct RunLauncher<S: EventStore = MemoryEventStore> {
    registry: Arc<RunRegistry<S>>,
    transport: SharedTransport,
    catalog: Arc<RuleCatalog>,
    config: OrchestratorConfig,
    /// Cancel switches of coordinators running in this process
    active: Arc<Mutex<HashMap<RunId, watch::Sender<bool>>>>,
}

impl<S: EventStore> RunLauncher<S> {
    pub fn new(
        registry: Arc<RunRegistry<S>>,
        transport: SharedTransport,
        catalog: RuleCatalog,
        config: OrchestratorConfig,
    ) -> FlameResult<Self> {
        config.validate()?;
        Ok(RunLauncher {
            registry,
            transport,
            catalog: Arc::new(catalog),
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry<S>> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate, create, provision and start a run
    pub async fn launch_run(&self, request: LaunchRequest) -> FlameResult<LaunchResponse> {
        let run_id = request.run_id.clone();
        let identity = identify(&request)?;
        if let Some(caller) = &request.caller {
            self.authorize(caller, &request.consortium_id)?;
        }
        if let Some(existing) = self.replay(&run_id, &identity.fingerprint)? {
            return Ok(existing);
        }
        let plan = self.plan(&request, identity)?;

        let created = RunEvent::RunCreated {
            consortium_id: request.consortium_id.clone(),
            image: plan.image.clone(),
            parameters: request.computation_parameters.clone(),
            members: plan.members.clone(),
            fingerprint: plan.fingerprint.clone(),
        };
        match self.registry.append_event(&run_id, created, None) {
            Ok(_) => {}
            Err(FlameError::RunExists(_)) => {
                // Lost a race with a concurrent launch of the same id
                if let Some(existing) = self.replay(&run_id, &plan.fingerprint)? {
                    return Ok(existing);
                }
                return Err(FlameError::RunExists(run_id));
            }
            Err(e) => return Err(e),
        }
        tracing::info!(
            run_id = %run_id,
            consortium = %request.consortium_id,
            image = %plan.image,
            members = plan.members.len(),
            quorum = plan.quorum,
            "run created"
        );

        let lease = self
            .registry
            .acquire_lease(&run_id, &self.config.holder_id, self.config.lease_ttl)?;
        self.registry.append_event(
            &run_id,
            RunEvent::ProvisioningStarted {
                holder: self.config.holder_id.clone(),
            },
            Some(&lease),
        )?;

        let (reachable, unreachable) = self.probe(&plan.contributors).await;
        if reachable.len() < plan.quorum {
            let err = FlameError::Provisioning {
                run_id: run_id.clone(),
                reason: format!(
                    "{} of {} contributors reachable, {} required",
                    reachable.len(),
                    plan.contributors.len(),
                    plan.quorum
                ),
            };
            self.registry.append_event(
                &run_id,
                RunEvent::RunFailed {
                    code: err.code().into(),
                    reason: err.to_string(),
                },
                Some(&lease),
            )?;
            self.registry.release_lease(&lease);
            tracing::warn!(run_id = %run_id, unreachable = ?unreachable, "provisioning failed");
            return Err(err);
        }

        self.registry.append_event(
            &run_id,
            RunEvent::RunStarted {
                active: reachable.clone(),
                unreachable: unreachable.clone(),
            },
            Some(&lease),
        )?;
        if !unreachable.is_empty() {
            tracing::warn!(run_id = %run_id, unreachable = ?unreachable, "starting without unreachable contributors");
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.lock().insert(run_id.clone(), cancel_tx);
        let ctx = RunContext {
            run_id: run_id.clone(),
            image: plan.image,
            parameters: request.computation_parameters,
            active: reachable.into_iter().collect(),
            quorum: plan.quorum,
            aggregator: plan.aggregator,
        };
        let coordinator = RoundCoordinator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.transport),
            self.config.clone(),
            ctx,
            lease,
            cancel_rx,
        );

        let active = Arc::clone(&self.active);
        let registry = Arc::clone(&self.registry);
        let holder = self.config.holder_id.clone();
        let lease_ttl = self.config.lease_ttl;
        let span = tracing::info_span!("run", run_id = %run_id);
        let task_run_id = run_id.clone();
        tokio::spawn(
            async move {
                match coordinator.run().await {
                    Ok(report) => tracing::info!(
                        status = %report.status,
                        rounds = report.stats.rounds,
                        retries = report.stats.retries,
                        exclusions = report.stats.exclusions,
                        "coordinator finished"
                    ),
                    Err(e) => {
                        tracing::error!(code = e.code(), "coordinator stopped: {}", e);
                        if let Err(err) = record_abandonment(&*registry, &task_run_id, &holder, lease_ttl, &e) {
                            tracing::error!(code = err.code(), "could not record stopped coordinator: {}", err);
                        }
                    }
                }
                active.lock().remove(&task_run_id);
            }
            .instrument(span),
        );

        Ok(LaunchResponse {
            run_id,
            status: RunStatus::Running,
        })
    }

    /// Only the consortium owner may launch or relaunch its runs
    fn authorize(&self, caller: &NodeId, consortium_id: &ConsortiumId) -> FlameResult<()> {
        let consortium = self.registry.consortium(consortium_id)?;
        if *caller != consortium.owner {
            return Err(FlameError::Unauthorized {
                caller: caller.clone(),
                consortium: consortium.id.clone(),
            });
        }
        Ok(())
    }

    /// Validation against the current consortium and catalog, in the order
    /// callers see the errors
    fn plan(&self, request: &LaunchRequest, identity: Identity) -> FlameResult<Plan> {
        let consortium = self.registry.consortium(&request.consortium_id)?;
        if request.user_ids.is_empty() {
            return Err(FlameError::Validation("userIds is empty".into()));
        }
        let mut seen = HashSet::new();
        for node in &request.user_ids {
            if !seen.insert(node) {
                return Err(FlameError::Validation(format!("{node} is selected twice")));
            }
            if !consortium.is_member(node) {
                return Err(FlameError::Validation(format!(
                    "{node} is not a member of consortium {}",
                    consortium.id
                )));
            }
        }

        let contributors: Vec<NodeId> = consortium
            .contributors(&request.user_ids)
            .into_iter()
            .cloned()
            .collect();
        if contributors.is_empty() {
            return Err(FlameError::Validation("No ready contributors for this run".into()));
        }
        consortium.quorum.validate(contributors.len())?;
        let quorum = consortium.quorum.required(contributors.len());

        let aggregator = self
            .catalog
            .resolve(&identity.image, &request.computation_parameters)?;
        Ok(Plan {
            image: identity.image,
            members: identity.members,
            contributors,
            quorum,
            fingerprint: identity.fingerprint,
            aggregator,
        })
    }

    /// Existing run under this id: same request returns it, any other conflicts
    fn replay(&self, run_id: &RunId, fingerprint: &str) -> FlameResult<Option<LaunchResponse>> {
        let run = match self.registry.get_run(run_id) {
            Ok(run) => run,
            Err(FlameError::RunNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if run.fingerprint != fingerprint {
            return Err(FlameError::Conflict {
                run_id: run_id.clone(),
                reason: "run id already used with different launch fields".into(),
            });
        }
        tracing::debug!(run_id = %run_id, status = %run.status, "idempotent relaunch");
        Ok(Some(LaunchResponse {
            run_id: run.id,
            status: run.status,
        }))
    }

    /// Probe contributors concurrently; returns (reachable, unreachable)
    async fn probe(&self, contributors: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
        let timeout = self.config.provisioning_timeout;
        let mut probes = JoinSet::new();
        for node in contributors {
            let transport = Arc::clone(&self.transport);
            let node = node.clone();
            probes.spawn(async move {
                let reachable = match tokio::time::timeout(timeout, transport.connect(&node)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!(node = %node, "probe failed: {}", e);
                        false
                    }
                    Err(_) => {
                        tracing::debug!(node = %node, "probe timed out after {}", fmt_duration(timeout));
                        false
                    }
                };
                (node, reachable)
            });
        }

        let mut outcome = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok((node, reachable)) = joined {
                outcome.insert(node, reachable);
            }
        }
        let (reachable, unreachable) = contributors
            .iter()
            .cloned()
            .partition(|node| outcome.get(node).copied().unwrap_or(false));
        (reachable, unreachable)
    }

    /// Cancel a run.
    ///
    /// A run coordinated by this launcher is signalled and its coordinator
    /// records the cancellation. Otherwise the run is cancelled directly,
    /// which needs the run's lease to be free.
    pub async fn cancel_run(&self, run_id: &RunId) -> FlameResult<()> {
        let signalled = match self.active.lock().get(run_id) {
            Some(cancel) => cancel.send(true).is_ok(),
            None => false,
        };
        if signalled {
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(());
        }

        let view = self.registry.view(run_id)?;
        match view.run.status {
            RunStatus::Cancelled => return Ok(()),
            status if status.is_terminal() => {
                return Err(FlameError::InvalidTransition {
                    run_id: run_id.clone(),
                    from: status,
                    to: RunStatus::Cancelled,
                })
            }
            _ => {}
        }

        let lease = self
            .registry
            .acquire_lease(run_id, &self.config.holder_id, self.config.lease_ttl)?;
        let cancelled = close_run(&*self.registry, &lease, view.open_round, RunEvent::RunCancelled);
        self.registry.release_lease(&lease);
        cancelled?;
        tracing::info!(run_id = %run_id, "run cancelled directly");
        Ok(())
    }

    /// Wait until the run is terminal.
    ///
    /// Completed and failed runs are returned; a cancelled run is reported
    /// as `RunCancelled`. A coordinator that stops early records the run as
    /// failed, but if that record cannot be written either (a failing event
    /// store) the run never turns terminal, so callers that cannot wait
    /// forever should wrap this in `tokio::time::timeout`.
    pub async fn wait_for_completion(&self, run_id: &RunId) -> FlameResult<Run> {
        let mut events = self.registry.subscribe();
        loop {
            let run = self.registry.get_run(run_id)?;
            match run.status {
                RunStatus::Cancelled => return Err(FlameError::RunCancelled(run_id.clone())),
                status if status.is_terminal() => return Ok(run),
                _ => {}
            }

            // Any event for this run, or a lag, means the view may have moved.
            loop {
                match events.recv().await {
                    Ok(event) if event.run_id == *run_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(FlameError::Storage("registry event feed closed".into()))
                    }
                }
            }
        }
    }

    pub fn get_run_status(&self, run_id: &RunId) -> FlameResult<RunStatusReport> {
        self.registry.get_run_status(run_id)
    }

    /// Runs whose coordinator lives in this launcher
    pub fn coordinated_runs(&self) -> BTreeSet<RunId> {
        self.active.lock().keys().cloned().collect()
    }
}

/// Launch identity: the image, the sorted members and their fingerprint
fn identify(request: &LaunchRequest) -> FlameResult<Identity> {
    if request.run_id.is_empty() {
        return Err(FlameError::Validation("runId is empty".into()));
    }
    let image = ImageRef::parse(&request.image_ref)?;
    let mut members = request.user_ids.clone();
    members.sort();
    let fingerprint = fingerprint(
        &request.consortium_id,
        &image,
        &members,
        &request.computation_parameters,
    );
    Ok(Identity {
        image,
        members,
        fingerprint,
    })
}

/// Abort the open round, if any, then record the terminal event
fn close_run<S: EventStore>(
    registry: &RunRegistry<S>,
    lease: &RunLease,
    open_round: Option<RoundNumber>,
    terminal: RunEvent,
) -> FlameResult<()> {
    if let Some(round) = open_round {
        registry.append_event(
            &lease.run_id,
            RunEvent::RoundClosed {
                round,
                decision: RoundDecision::Abort,
                results: BTreeMap::new(),
            },
            Some(lease),
        )?;
    }
    registry.append_event(&lease.run_id, terminal, Some(lease))?;
    Ok(())
}

/// Fail a run whose coordinator stopped before finishing it.
///
/// Skipped when the run already ended or another holder owns its lease.
fn record_abandonment<S: EventStore>(
    registry: &RunRegistry<S>,
    run_id: &RunId,
    holder: &str,
    lease_ttl: std::time::Duration,
    cause: &FlameError,
) -> FlameResult<()> {
    let view = registry.view(run_id)?;
    if view.run.status.is_terminal() {
        return Ok(());
    }
    let lease = match registry.acquire_lease(run_id, holder, lease_ttl) {
        Ok(lease) => lease,
        Err(FlameError::LeaseConflict { holder: owner, .. }) => {
            tracing::warn!(run_id = %run_id, owner = %owner, "run taken over, leaving it to its new holder");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let failed = RunEvent::RunFailed {
        code: cause.code().into(),
        reason: format!("coordinator stopped: {cause}"),
    };
    let recorded = close_run(registry, &lease, view.open_round, failed);
    registry.release_lease(&lease);
    recorded?;
    tracing::warn!(run_id = %run_id, code = cause.code(), "run failed after its coordinator stopped");
    Ok(())
}
