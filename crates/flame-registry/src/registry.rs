//! Run registry
//!
//! Consortiums, runs and round history. `append_event` is the only way a run
//! changes: it checks the caller's lease, status monotonicity and round
//! ordering, writes the event to the store and then folds it into the view.
//! Writes to one run are serialized by that run's view lock and its lease;
//! there is no lock spanning all runs during an append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use flame_core::{
    Consortium, ConsortiumId, FlameError, FlameResult, NodeId, Round, Run, RunEvent, RunId, RunStatus,
    SequencedEvent,
};

use crate::{EventStore, MemoryEventStore, RunLease, RunStatusReport, RunView};

/// Subscriber queue depth; slow subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Single source of truth for consortiums and runs
pub struct RunRegistry<S: EventStore = MemoryEventStore> {
    store: S,
    consortiums: RwLock<HashMap<ConsortiumId, Consortium>>,
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunView>>>>,
    events: broadcast::Sender<SequencedEvent>,
}

impl RunRegistry<MemoryEventStore> {
    /// Registry over a fresh in-memory store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        RunRegistry {
            store: MemoryEventStore::new(),
            consortiums: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Default for RunRegistry<MemoryEventStore> {
    fn default() -> Self {
        RunRegistry::new()
    }
}

impl<S: EventStore> RunRegistry<S> {
    /// Open a registry over `store`, rebuilding every run view from its log
    pub fn open(store: S) -> FlameResult<Self> {
        let mut runs = HashMap::new();
        for run_id in store.run_ids()? {
            let events = store.scan(&run_id, 1)?;
            let view = RunView::fold(&run_id, &events)?;
            tracing::debug!(run_id = %run_id, status = %view.run.status, events = events.len(), "run view rebuilt");
            runs.insert(run_id, Arc::new(Mutex::new(view)));
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(RunRegistry {
            store,
            consortiums: RwLock::new(HashMap::new()),
            runs: RwLock::new(runs),
            events,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Consortiums
    // ------------------------------------------------------------------------

    /// Register or replace a consortium
    pub fn register_consortium(&self, consortium: Consortium) -> FlameResult<()> {
        let mut consortiums = self.consortiums.write();
        if consortiums.contains_key(&consortium.id) {
            self.ensure_no_active_run(&consortium.id)?;
        }
        tracing::debug!(consortium = %consortium.id, members = consortium.members().len(), "consortium registered");
        consortiums.insert(consortium.id.clone(), consortium);
        Ok(())
    }

    /// Replace a consortium's member set; refused while any of its runs is active
    pub fn update_members(
        &self,
        id: &ConsortiumId,
        members: Vec<NodeId>,
    ) -> FlameResult<Consortium> {
        let mut consortiums = self.consortiums.write();
        let consortium = consortiums
            .get_mut(id)
            .ok_or_else(|| FlameError::ConsortiumNotFound(id.clone()))?;
        self.ensure_no_active_run(id)?;
        consortium.replace_members(members)?;
        Ok(consortium.clone())
    }

    pub fn consortium(&self, id: &ConsortiumId) -> FlameResult<Consortium> {
        self.consortiums
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FlameError::ConsortiumNotFound(id.clone()))
    }

    fn ensure_no_active_run(&self, consortium: &ConsortiumId) -> FlameResult<()> {
        for view in self.views() {
            let view = view.lock();
            if view.run.consortium_id == *consortium && view.run.status.is_active() {
                return Err(FlameError::Conflict {
                    run_id: view.run.id.clone(),
                    reason: format!("consortium {consortium} is pinned by an active run"),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Append an event to a run's log.
    ///
    /// `RunCreated` needs no lease and fails with `RunExists` if the run is
    /// already known. Every other event must present the run's live lease.
    pub fn append_event(
        &self,
        run_id: &RunId,
        event: RunEvent,
        lease: Option<&RunLease>,
    ) -> FlameResult<SequencedEvent> {
        if matches!(event, RunEvent::RunCreated { .. }) {
            return self.create_run(run_id, event);
        }

        let view = self.view_handle(run_id)?;
        let mut view = view.lock();
        let now = Utc::now();
        validate(&view, &event, lease, now)?;

        let sequenced = self.store.append(run_id, event, now)?;
        view.apply(&sequenced);
        tracing::debug!(
            run_id = %run_id,
            seq = sequenced.seq,
            event = sequenced.event.name(),
            status = %view.run.status,
            "event appended"
        );
        let _ = self.events.send(sequenced.clone());
        Ok(sequenced)
    }

    fn create_run(&self, run_id: &RunId, event: RunEvent) -> FlameResult<SequencedEvent> {
        if run_id.is_empty() {
            return Err(FlameError::Validation("run id is empty".into()));
        }
        let consortiums = self.consortiums.read();
        if let RunEvent::RunCreated {
            consortium_id,
            members,
            ..
        } = &event
        {
            let consortium = consortiums
                .get(consortium_id)
                .ok_or_else(|| FlameError::ConsortiumNotFound(consortium_id.clone()))?;
            if let Some(stray) = members.iter().find(|node| !consortium.is_member(node)) {
                return Err(FlameError::Validation(format!(
                    "{stray} is not a member of consortium {consortium_id}"
                )));
            }
        }

        let mut runs = self.runs.write();
        if runs.contains_key(run_id) {
            return Err(FlameError::RunExists(run_id.clone()));
        }
        let sequenced = self.store.append(run_id, event, Utc::now())?;
        let view = RunView::create(&sequenced)?;
        runs.insert(run_id.clone(), Arc::new(Mutex::new(view)));
        tracing::debug!(run_id = %run_id, seq = sequenced.seq, "run created");
        let _ = self.events.send(sequenced.clone());
        Ok(sequenced)
    }

    // ------------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------------

    /// Acquire the run's lease for `holder`
    pub fn acquire_lease(&self, run_id: &RunId, holder: &str, ttl: Duration) -> FlameResult<RunLease> {
        let view = self.view_handle(run_id)?;
        let mut view = view.lock();
        view.lease.acquire(run_id, holder, ttl, Utc::now())
    }

    /// Extend a live lease
    pub fn renew_lease(&self, lease: &RunLease, ttl: Duration) -> FlameResult<RunLease> {
        let view = self.view_handle(&lease.run_id)?;
        let mut view = view.lock();
        view.lease.renew(lease, ttl, Utc::now())
    }

    /// Release a lease; false if it was no longer held
    pub fn release_lease(&self, lease: &RunLease) -> bool {
        match self.view_handle(&lease.run_id) {
            Ok(view) => view.lock().lease.release(lease),
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_run(&self, run_id: &RunId) -> FlameResult<Run> {
        Ok(self.view_handle(run_id)?.lock().run.clone())
    }

    /// Full derived view, including open round and lease state
    pub fn view(&self, run_id: &RunId) -> FlameResult<RunView> {
        Ok(self.view_handle(run_id)?.lock().clone())
    }

    /// Runs of a consortium, oldest first
    pub fn list_runs_by_consortium(&self, consortium: &ConsortiumId) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .views()
            .into_iter()
            .filter_map(|view| {
                let view = view.lock();
                (view.run.consortium_id == *consortium).then(|| view.run.clone())
            })
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    pub fn get_run_status(&self, run_id: &RunId) -> FlameResult<RunStatusReport> {
        Ok(self.view_handle(run_id)?.lock().status_report())
    }

    /// The run's complete event log
    pub fn history(&self, run_id: &RunId) -> FlameResult<Vec<SequencedEvent>> {
        self.view_handle(run_id)?;
        self.store.scan(run_id, 1)
    }

    pub fn rounds(&self, run_id: &RunId) -> FlameResult<Vec<Round>> {
        Ok(self.view_handle(run_id)?.lock().rounds.clone())
    }

    /// Live feed of every appended event, across runs
    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.events.subscribe()
    }

    fn view_handle(&self, run_id: &RunId) -> FlameResult<Arc<Mutex<RunView>>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| FlameError::RunNotFound(run_id.clone()))
    }

    fn views(&self) -> Vec<Arc<Mutex<RunView>>> {
        self.runs.read().values().cloned().collect()
    }
}

/// Checks an event against the run's current view before it is appended
fn validate(
    view: &RunView,
    event: &RunEvent,
    lease: Option<&RunLease>,
    now: chrono::DateTime<Utc>,
) -> FlameResult<()> {
    let run_id = &view.run.id;
    let lease = lease.ok_or_else(|| FlameError::LeaseExpired(run_id.clone()))?;
    view.lease.verify(lease, now)?;

    let status = view.run.status;
    let next = event.status_effect();
    if status.is_terminal() {
        return Err(FlameError::InvalidTransition {
            run_id: run_id.clone(),
            from: status,
            to: next.unwrap_or(status),
        });
    }
    if let Some(next) = next {
        if !status.can_transition_to(next) {
            return Err(FlameError::InvalidTransition {
                run_id: run_id.clone(),
                from: status,
                to: next,
            });
        }
        if let Some(open) = view.open_round {
            return Err(FlameError::RoundOrdering {
                run_id: run_id.clone(),
                reason: format!("round {open} must close before {}", event.name()),
            });
        }
    }

    let ordering = |reason: String| FlameError::RoundOrdering {
        run_id: run_id.clone(),
        reason,
    };
    match event {
        RunEvent::RoundStarted { round, .. } => {
            if status != RunStatus::Running {
                return Err(ordering(format!("cannot start round {round} while {status}")));
            }
            if let Some(open) = view.open_round {
                return Err(ordering(format!("round {open} is still open")));
            }
            if *round != view.next_round {
                return Err(ordering(format!(
                    "expected round {}, got {round}",
                    view.next_round
                )));
            }
        }
        RunEvent::NodeRetried { round, .. }
        | RunEvent::NodeExcluded { round, .. }
        | RunEvent::RoundClosed { round, .. } => {
            if view.open_round != Some(*round) {
                return Err(ordering(format!("round {round} is not open")));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flame_core::{
        fingerprint, FailureKind, ImageRef, NodeResult, RoundDecision, RunStatus,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    const TTL: Duration = Duration::from_secs(30);

    fn nodes() -> Vec<NodeId> {
        vec![NodeId::new("a"), NodeId::new("b")]
    }

    fn registry() -> RunRegistry {
        let registry = RunRegistry::new();
        registry
            .register_consortium(Consortium::new("c", "owner", nodes()).unwrap())
            .unwrap();
        registry
    }

    fn created() -> RunEvent {
        let image = ImageRef::parse("stats/mean").unwrap();
        let consortium_id = ConsortiumId::new("c");
        let parameters = json!({});
        RunEvent::RunCreated {
            fingerprint: fingerprint(&consortium_id, &image, &nodes(), &parameters),
            consortium_id,
            image,
            parameters,
            members: nodes(),
        }
    }

    fn started(round: u64) -> RunEvent {
        RunEvent::RoundStarted {
            round,
            input: json!({}),
            active: nodes(),
            deadline: Utc::now(),
        }
    }

    fn closed(round: u64) -> RunEvent {
        RunEvent::RoundClosed {
            round,
            decision: RoundDecision::Advance,
            results: BTreeMap::new(),
        }
    }

    /// Created run brought to Running, with its lease
    fn running(registry: &RunRegistry, run: &RunId) -> RunLease {
        registry.append_event(run, created(), None).unwrap();
        let lease = registry.acquire_lease(run, "coord", TTL).unwrap();
        registry
            .append_event(run, RunEvent::ProvisioningStarted { holder: "coord".into() }, Some(&lease))
            .unwrap();
        registry
            .append_event(
                run,
                RunEvent::RunStarted {
                    active: nodes(),
                    unreachable: vec![],
                },
                Some(&lease),
            )
            .unwrap();
        lease
    }

    #[test]
    fn test_create_is_unique() {
        let registry = registry();
        let run = RunId::new("r");
        registry.append_event(&run, created(), None).unwrap();
        assert!(matches!(
            registry.append_event(&run, created(), None),
            Err(FlameError::RunExists(_))
        ));
        assert_eq!(registry.get_run(&run).unwrap().status, RunStatus::Created);
    }

    #[test]
    fn test_create_rejects_non_members() {
        let registry = registry();
        let mut event = created();
        if let RunEvent::RunCreated { members, .. } = &mut event {
            members.push(NodeId::new("stranger"));
        }
        assert!(matches!(
            registry.append_event(&RunId::new("r"), event, None),
            Err(FlameError::Validation(_))
        ));
    }

    #[test]
    fn test_append_requires_lease() {
        let registry = registry();
        let run = RunId::new("r");
        registry.append_event(&run, created(), None).unwrap();
        let err = registry
            .append_event(&run, RunEvent::ProvisioningStarted { holder: "x".into() }, None)
            .unwrap_err();
        assert_eq!(err.code(), "LEASE_EXPIRED");
    }

    #[test]
    fn test_second_coordinator_cannot_take_live_lease() {
        let registry = registry();
        let run = RunId::new("r");
        let _lease = running(&registry, &run);
        assert!(matches!(
            registry.acquire_lease(&run, "other", TTL),
            Err(FlameError::LeaseConflict { .. })
        ));
    }

    #[test]
    fn test_status_never_goes_backwards() {
        let registry = registry();
        let run = RunId::new("r");
        let lease = running(&registry, &run);
        let err = registry
            .append_event(&run, RunEvent::ProvisioningStarted { holder: "coord".into() }, Some(&lease))
            .unwrap_err();
        assert!(matches!(err, FlameError::InvalidTransition { .. }));

        registry
            .append_event(&run, RunEvent::RunCancelled, Some(&lease))
            .unwrap();
        let err = registry
            .append_event(&run, RunEvent::RunCompleted { result: json!(1) }, Some(&lease))
            .unwrap_err();
        assert!(matches!(err, FlameError::InvalidTransition { .. }));
    }

    #[test]
    fn test_round_ordering() {
        let registry = registry();
        let run = RunId::new("r");
        let lease = running(&registry, &run);

        let skip = registry.append_event(&run, started(1), Some(&lease));
        assert!(matches!(skip, Err(FlameError::RoundOrdering { .. })));

        registry.append_event(&run, started(0), Some(&lease)).unwrap();
        let overlap = registry.append_event(&run, started(1), Some(&lease));
        assert!(matches!(overlap, Err(FlameError::RoundOrdering { .. })));

        let finish_early =
            registry.append_event(&run, RunEvent::RunCompleted { result: json!(0) }, Some(&lease));
        assert!(matches!(finish_early, Err(FlameError::RoundOrdering { .. })));

        registry.append_event(&run, closed(0), Some(&lease)).unwrap();
        registry.append_event(&run, started(1), Some(&lease)).unwrap();
        assert_eq!(registry.get_run_status(&run).unwrap().current_round, 1);

        let stale = RunEvent::NodeExcluded {
            round: 0,
            node: NodeId::new("a"),
            kind: FailureKind::NonZeroExit,
            detail: "late".into(),
        };
        assert!(registry.append_event(&run, stale, Some(&lease)).is_err());
    }

    #[test]
    fn test_members_pinned_while_run_active() {
        let registry = registry();
        let run = RunId::new("r");
        let lease = running(&registry, &run);
        let consortium = ConsortiumId::new("c");

        let err = registry
            .update_members(&consortium, vec![NodeId::new("a")])
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        registry
            .append_event(&run, RunEvent::RunCancelled, Some(&lease))
            .unwrap();
        let updated = registry
            .update_members(&consortium, vec![NodeId::new("a")])
            .unwrap();
        assert_eq!(updated.members(), &[NodeId::new("a")]);
    }

    #[test]
    fn test_queries() {
        let registry = registry();
        let run = RunId::new("r");
        let lease = running(&registry, &run);
        registry.append_event(&run, started(0), Some(&lease)).unwrap();
        registry
            .append_event(
                &run,
                RunEvent::RoundClosed {
                    round: 0,
                    decision: RoundDecision::Finalize,
                    results: nodes()
                        .into_iter()
                        .map(|n| (n, NodeResult::Success { output: json!(2) }))
                        .collect(),
                },
                Some(&lease),
            )
            .unwrap();
        registry
            .append_event(&run, RunEvent::RunCompleted { result: json!(2) }, Some(&lease))
            .unwrap();

        let history = registry.history(&run).unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(registry.rounds(&run).unwrap().len(), 1);
        assert_eq!(registry.list_runs_by_consortium(&ConsortiumId::new("c")).len(), 1);
        assert!(registry.list_runs_by_consortium(&ConsortiumId::new("x")).is_empty());

        let report = registry.get_run_status(&run).unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("currentRound").is_some());
        assert!(json.get("lastUpdated").is_some());

        assert!(matches!(
            registry.get_run(&RunId::new("missing")),
            Err(FlameError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_appends_in_order() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let run = RunId::new("r");
        let _lease = running(&registry, &run);

        let names: Vec<&str> = (0..3)
            .map(|_| rx.try_recv().unwrap().event.name())
            .collect();
        assert_eq!(names, vec!["RunCreated", "ProvisioningStarted", "RunStarted"]);
    }

    #[test]
    fn test_open_rebuilds_views_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let run = RunId::new("r");
        {
            let registry = RunRegistry::open(crate::JournalEventStore::open(&path).unwrap()).unwrap();
            registry
                .register_consortium(Consortium::new("c", "owner", nodes()).unwrap())
                .unwrap();
            registry.append_event(&run, created(), None).unwrap();
            let lease = registry.acquire_lease(&run, "coord", TTL).unwrap();
            registry
                .append_event(&run, RunEvent::ProvisioningStarted { holder: "coord".into() }, Some(&lease))
                .unwrap();
            registry
                .append_event(
                    &run,
                    RunEvent::RunFailed {
                        code: "PROVISIONING".into(),
                        reason: "no node reachable".into(),
                    },
                    Some(&lease),
                )
                .unwrap();
        }

        let registry = RunRegistry::open(crate::JournalEventStore::open(&path).unwrap()).unwrap();
        let restored = registry.get_run(&run).unwrap();
        assert_eq!(restored.status, RunStatus::Failed);
        assert_eq!(restored.errors.len(), 1);
        assert!(restored.errors[0].reason.contains("no node reachable"));
        assert_eq!(registry.history(&run).unwrap().len(), 3);
    }

    fn arbitrary_event(choice: u8) -> RunEvent {
        match choice % 8 {
            0 => RunEvent::ProvisioningStarted { holder: "coord".into() },
            1 => RunEvent::RunStarted {
                active: nodes(),
                unreachable: vec![],
            },
            2 => started(0),
            3 => closed(0),
            4 => RunEvent::RunCompleted { result: json!(null) },
            5 => RunEvent::RunFailed {
                code: "QUORUM_LOST".into(),
                reason: "x".into(),
            },
            6 => RunEvent::RunCancelled,
            _ => started(1),
        }
    }

    proptest! {
        #[test]
        fn prop_observed_statuses_are_monotonic(choices in proptest::collection::vec(any::<u8>(), 0..24)) {
            let registry = registry();
            let run = RunId::new("r");
            registry.append_event(&run, created(), None).unwrap();
            let lease = registry.acquire_lease(&run, "coord", TTL).unwrap();
            for choice in choices {
                let _ = registry.append_event(&run, arbitrary_event(choice), Some(&lease));
            }

            let statuses: Vec<RunStatus> = registry
                .history(&run)
                .unwrap()
                .iter()
                .filter_map(|e| e.event.status_effect())
                .collect();
            for pair in statuses.windows(2) {
                prop_assert!(pair[0].can_transition_to(pair[1]), "{:?}", statuses);
            }
        }
    }
}
