//! Derived run views
//!
//! A run's current state is never stored: it is the fold of its event log.
//! `RunView::apply` is that fold step; validation happens in the registry
//! before an event is appended, so applying never fails.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flame_core::{
    FlameError, FlameResult, NodeId, NodeResult, Round, RoundNumber, Run, RunErrorRecord, RunEvent,
    RunId, RunStatus, Seq, SequencedEvent,
};

use crate::LeaseSlot;

/// Read-only status summary for observers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusReport {
    pub status: RunStatus,
    pub current_round: RoundNumber,
    pub last_updated: DateTime<Utc>,
}

/// Current state of one run, folded from its log
#[derive(Clone, Debug)]
pub struct RunView {
    pub run: Run,
    pub rounds: Vec<Round>,
    /// Round started but not yet closed
    pub open_round: Option<RoundNumber>,
    /// Number the next `RoundStarted` must carry
    pub next_round: RoundNumber,
    pub last_seq: Seq,
    pub lease: LeaseSlot,
}

impl RunView {
    /// Start a view from the run's first event, which must be `RunCreated`
    pub fn create(first: &SequencedEvent) -> FlameResult<Self> {
        let RunEvent::RunCreated {
            consortium_id,
            image,
            parameters,
            members,
            fingerprint,
        } = &first.event
        else {
            return Err(FlameError::Storage(format!(
                "run {} log starts with {}",
                first.run_id,
                first.event.name()
            )));
        };

        Ok(RunView {
            run: Run {
                id: first.run_id.clone(),
                consortium_id: consortium_id.clone(),
                image: image.clone(),
                parameters: parameters.clone(),
                members: members.clone(),
                status: RunStatus::Created,
                current_round: 0,
                created_at: first.at,
                updated_at: first.at,
                result: None,
                errors: Vec::new(),
                excluded: Default::default(),
                fingerprint: fingerprint.clone(),
            },
            rounds: Vec::new(),
            open_round: None,
            next_round: 0,
            last_seq: first.seq,
            lease: LeaseSlot::default(),
        })
    }

    /// Rebuild a view from a complete log
    pub fn fold(run_id: &RunId, events: &[SequencedEvent]) -> FlameResult<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| FlameError::RunNotFound(run_id.clone()))?;
        let mut view = RunView::create(first)?;
        for event in rest {
            view.apply(event);
        }
        Ok(view)
    }

    pub fn status_report(&self) -> RunStatusReport {
        RunStatusReport {
            status: self.run.status,
            current_round: self.run.current_round,
            last_updated: self.run.updated_at,
        }
    }

    /// Fold one event into the view
    pub fn apply(&mut self, sequenced: &SequencedEvent) {
        let at = sequenced.at;
        self.last_seq = sequenced.seq;
        self.run.updated_at = at;
        if let Some(status) = sequenced.event.status_effect() {
            self.run.status = status;
        }

        match &sequenced.event {
            RunEvent::RunCreated { .. } | RunEvent::ProvisioningStarted { .. } => {}
            RunEvent::RunStarted { unreachable, .. } => {
                for node in unreachable {
                    self.run.excluded.insert(node.clone());
                    self.record_error("unreachable at provisioning".into(), Some(node), None, at);
                }
            }
            RunEvent::RoundStarted {
                round,
                input,
                active,
                deadline,
            } => {
                self.run.current_round = *round;
                self.open_round = Some(*round);
                self.rounds.push(Round {
                    run_id: self.run.id.clone(),
                    number: *round,
                    input: input.clone(),
                    results: active
                        .iter()
                        .map(|node| (node.clone(), NodeResult::Pending))
                        .collect(),
                    deadline: *deadline,
                    decision: None,
                });
            }
            RunEvent::NodeRetried { .. } => {}
            RunEvent::NodeExcluded {
                round,
                node,
                kind,
                detail,
            } => {
                self.run.excluded.insert(node.clone());
                if let Some(r) = self.round_mut(*round) {
                    r.results.insert(
                        node.clone(),
                        NodeResult::Failure {
                            kind: *kind,
                            detail: detail.clone(),
                        },
                    );
                }
                self.record_error(format!("{kind}: {detail}"), Some(node), Some(*round), at);
            }
            RunEvent::RoundClosed {
                round,
                decision,
                results,
            } => {
                if let Some(r) = self.round_mut(*round) {
                    merge_results(&mut r.results, results);
                    r.decision = Some(*decision);
                }
                self.open_round = None;
                self.next_round = round + 1;
            }
            RunEvent::RunCompleted { result } => {
                self.run.result = Some(result.clone());
            }
            RunEvent::RunFailed { code, reason } => {
                self.record_error(format!("{code}: {reason}"), None, self.open_round, at);
            }
            RunEvent::RunCancelled => {}
        }
    }

    pub fn round(&self, number: RoundNumber) -> Option<&Round> {
        self.rounds.iter().find(|r| r.number == number)
    }

    fn round_mut(&mut self, number: RoundNumber) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.number == number)
    }

    fn record_error(
        &mut self,
        reason: String,
        node: Option<&NodeId>,
        round: Option<RoundNumber>,
        at: DateTime<Utc>,
    ) {
        self.run.errors.push(RunErrorRecord {
            reason,
            node: node.cloned(),
            round,
            at,
        });
    }
}

fn merge_results(
    into: &mut BTreeMap<NodeId, NodeResult>,
    from: &BTreeMap<NodeId, NodeResult>,
) {
    for (node, result) in from {
        into.insert(node.clone(), result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flame_core::{ConsortiumId, FailureKind, ImageRef, NodeId, RoundDecision};
    use serde_json::json;

    fn seq(n: Seq, event: RunEvent) -> SequencedEvent {
        SequencedEvent {
            run_id: RunId::new("r"),
            seq: n,
            at: Utc::now(),
            event,
        }
    }

    fn log() -> Vec<SequencedEvent> {
        let nodes = vec![NodeId::new("a"), NodeId::new("b")];
        vec![
            seq(
                1,
                RunEvent::RunCreated {
                    consortium_id: ConsortiumId::new("c"),
                    image: ImageRef::parse("stats/mean").unwrap(),
                    parameters: json!({"rounds": 1}),
                    members: nodes.clone(),
                    fingerprint: "f".into(),
                },
            ),
            seq(2, RunEvent::ProvisioningStarted { holder: "h".into() }),
            seq(
                3,
                RunEvent::RunStarted {
                    active: nodes.clone(),
                    unreachable: vec![],
                },
            ),
            seq(
                4,
                RunEvent::RoundStarted {
                    round: 0,
                    input: json!({"rounds": 1}),
                    active: nodes,
                    deadline: Utc::now(),
                },
            ),
            seq(
                5,
                RunEvent::NodeExcluded {
                    round: 0,
                    node: NodeId::new("b"),
                    kind: FailureKind::NonZeroExit,
                    detail: "exit 3".into(),
                },
            ),
            seq(
                6,
                RunEvent::RoundClosed {
                    round: 0,
                    decision: RoundDecision::Finalize,
                    results: [(NodeId::new("a"), NodeResult::Success { output: json!(1) })]
                        .into_iter()
                        .collect(),
                },
            ),
            seq(7, RunEvent::RunCompleted { result: json!(1) }),
        ]
    }

    #[test]
    fn test_fold_full_run() {
        let view = RunView::fold(&RunId::new("r"), &log()).unwrap();
        assert_eq!(view.run.status, RunStatus::Completed);
        assert_eq!(view.run.result, Some(json!(1)));
        assert_eq!(view.last_seq, 7);
        assert_eq!(view.next_round, 1);
        assert!(view.open_round.is_none());

        let round = view.round(0).unwrap();
        assert_eq!(round.decision, Some(RoundDecision::Finalize));
        assert!(round.results[&NodeId::new("a")].is_success());
        assert!(matches!(
            round.results[&NodeId::new("b")],
            NodeResult::Failure { kind: FailureKind::NonZeroExit, .. }
        ));
        assert!(view.run.excluded.contains(&NodeId::new("b")));
        assert_eq!(view.run.errors.len(), 1);
        assert_eq!(view.run.errors[0].round, Some(0));
    }

    #[test]
    fn test_fold_requires_created_first() {
        let events = log();
        assert!(RunView::fold(&RunId::new("r"), &events[1..]).is_err());
        assert!(matches!(
            RunView::fold(&RunId::new("r"), &[]),
            Err(FlameError::RunNotFound(_))
        ));
    }
}
