//! Run events
//!
//! The registry's append-only log is a sequence of these per run. Every status
//! change, retry and exclusion is an event, so history alone explains a run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ConsortiumId, FailureKind, ImageRef, NodeId, NodeResult, Payload, RoundDecision, RoundNumber,
    RunId, RunStatus, Seq,
};

/// Something that happened to a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunCreated {
        consortium_id: ConsortiumId,
        image: ImageRef,
        parameters: Payload,
        members: Vec<NodeId>,
        fingerprint: String,
    },
    ProvisioningStarted {
        holder: String,
    },
    RunStarted {
        active: Vec<NodeId>,
        unreachable: Vec<NodeId>,
    },
    RoundStarted {
        round: RoundNumber,
        input: Payload,
        active: Vec<NodeId>,
        deadline: DateTime<Utc>,
    },
    NodeRetried {
        round: RoundNumber,
        node: NodeId,
        attempt: u32,
        reason: FailureKind,
    },
    NodeExcluded {
        round: RoundNumber,
        node: NodeId,
        kind: FailureKind,
        detail: String,
    },
    RoundClosed {
        round: RoundNumber,
        decision: RoundDecision,
        results: BTreeMap<NodeId, NodeResult>,
    },
    RunCompleted {
        result: Payload,
    },
    RunFailed {
        code: String,
        reason: String,
    },
    RunCancelled,
}

impl RunEvent {
    /// Status this event moves the run into, if any
    pub fn status_effect(&self) -> Option<RunStatus> {
        match self {
            RunEvent::RunCreated { .. } => Some(RunStatus::Created),
            RunEvent::ProvisioningStarted { .. } => Some(RunStatus::Provisioning),
            RunEvent::RunStarted { .. } => Some(RunStatus::Running),
            RunEvent::RunCompleted { .. } => Some(RunStatus::Completed),
            RunEvent::RunFailed { .. } => Some(RunStatus::Failed),
            RunEvent::RunCancelled => Some(RunStatus::Cancelled),
            RunEvent::RoundStarted { .. }
            | RunEvent::NodeRetried { .. }
            | RunEvent::NodeExcluded { .. }
            | RunEvent::RoundClosed { .. } => None,
        }
    }

    /// Round this event belongs to, if any
    pub fn round(&self) -> Option<RoundNumber> {
        match self {
            RunEvent::RoundStarted { round, .. }
            | RunEvent::NodeRetried { round, .. }
            | RunEvent::NodeExcluded { round, .. }
            | RunEvent::RoundClosed { round, .. } => Some(*round),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunCreated { .. } => "RunCreated",
            RunEvent::ProvisioningStarted { .. } => "ProvisioningStarted",
            RunEvent::RunStarted { .. } => "RunStarted",
            RunEvent::RoundStarted { .. } => "RoundStarted",
            RunEvent::NodeRetried { .. } => "NodeRetried",
            RunEvent::NodeExcluded { .. } => "NodeExcluded",
            RunEvent::RoundClosed { .. } => "RoundClosed",
            RunEvent::RunCompleted { .. } => "RunCompleted",
            RunEvent::RunFailed { .. } => "RunFailed",
            RunEvent::RunCancelled => "RunCancelled",
        }
    }
}

/// An event as recorded: per-run sequence number and append time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub run_id: RunId,
    pub seq: Seq,
    pub at: DateTime<Utc>,
    pub event: RunEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_effects() {
        assert_eq!(RunEvent::RunCancelled.status_effect(), Some(RunStatus::Cancelled));
        let closed = RunEvent::RoundClosed {
            round: 1,
            decision: RoundDecision::Advance,
            results: BTreeMap::new(),
        };
        assert_eq!(closed.status_effect(), None);
        assert_eq!(closed.round(), Some(1));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = RunEvent::NodeExcluded {
            round: 0,
            node: NodeId::new("site-b"),
            kind: FailureKind::NonZeroExit,
            detail: "exit status 2".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("NodeExcluded"));
        assert_eq!(value["kind"], json!("non_zero_exit"));

        let back: RunEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
