//! Consortium, Run and Round records
//!
//! Runs and Rounds are never mutated directly: the registry derives them by
//! folding the run's event log. These types are the derived view.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    ConsortiumId, FlameError, FlameResult, ImageRef, NodeId, Payload, RoundNumber, RunId,
    RunStatus,
};

// ============================================================================
// CONSORTIUM
// ============================================================================

/// What a member does in a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// Holds data and executes the plugin every round
    #[default]
    Contributor,
    /// Follows the run, receives no round input
    Observer,
}

/// Minimum number of active contributors a run needs to continue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumPolicy {
    /// Every contributor selected for the run
    #[default]
    All,
    /// At least `n` contributors
    AtLeast(usize),
}

impl QuorumPolicy {
    /// Quorum threshold for a run with `contributors` selected contributors
    pub fn required(&self, contributors: usize) -> usize {
        match self {
            QuorumPolicy::All => contributors,
            QuorumPolicy::AtLeast(n) => *n,
        }
    }

    /// Checks that the policy can be met by a run of `contributors`
    pub fn validate(&self, contributors: usize) -> FlameResult<()> {
        match self {
            QuorumPolicy::AtLeast(0) => Err(FlameError::Validation(
                "quorum threshold must be at least 1".into(),
            )),
            QuorumPolicy::AtLeast(n) if *n > contributors => Err(FlameError::Validation(format!(
                "quorum of {n} cannot be met by {contributors} contributors"
            ))),
            _ => Ok(()),
        }
    }
}

/// A set of nodes that run computations together
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Consortium {
    pub id: ConsortiumId,
    pub owner: NodeId,
    members: Vec<NodeId>,
    roles: BTreeMap<NodeId, MemberRole>,
    pub quorum: QuorumPolicy,
}

impl Consortium {
    /// Create a consortium; members must be non-empty and duplicate-free
    pub fn new(
        id: impl Into<ConsortiumId>,
        owner: impl Into<NodeId>,
        members: impl IntoIterator<Item = NodeId>,
    ) -> FlameResult<Self> {
        let members = unique_members(members)?;
        Ok(Consortium {
            id: id.into(),
            owner: owner.into(),
            members,
            roles: BTreeMap::new(),
            quorum: QuorumPolicy::default(),
        })
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_role(mut self, node: impl Into<NodeId>, role: MemberRole) -> Self {
        self.roles.insert(node.into(), role);
        self
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    #[inline]
    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn role_of(&self, node: &NodeId) -> MemberRole {
        self.roles.get(node).copied().unwrap_or_default()
    }

    /// Contributors among `selected`, in selection order
    pub fn contributors<'a>(&self, selected: &'a [NodeId]) -> Vec<&'a NodeId> {
        selected
            .iter()
            .filter(|node| self.role_of(node) == MemberRole::Contributor)
            .collect()
    }

    /// Replace the member set. Callers must ensure no active run references it.
    pub fn replace_members(&mut self, members: impl IntoIterator<Item = NodeId>) -> FlameResult<()> {
        self.members = unique_members(members)?;
        let members = &self.members;
        self.roles.retain(|node, _| members.contains(node));
        Ok(())
    }
}

fn unique_members(members: impl IntoIterator<Item = NodeId>) -> FlameResult<Vec<NodeId>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for node in members {
        if !seen.insert(node.clone()) {
            return Err(FlameError::Validation(format!("duplicate member {node}")));
        }
        out.push(node);
    }
    if out.is_empty() {
        return Err(FlameError::Validation("consortium has no members".into()));
    }
    Ok(out)
}

// ============================================================================
// NODE RESULTS
// ============================================================================

/// Why a node's round attempt failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Plugin exited with a non-zero status
    NonZeroExit,
    /// Plugin did not emit exactly one terminal JSON object
    MalformedOutput,
    /// Plugin exceeded the node's local execution timeout
    ExecutionTimeout,
    TransportTimeout,
    TransportDisconnect,
    /// Round deadline elapsed before the node settled
    DeadlineExceeded,
}

impl FailureKind {
    /// Transport failures are retried; plugin failures are final
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::TransportTimeout | FailureKind::TransportDisconnect)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::TransportTimeout => "transport_timeout",
            FailureKind::TransportDisconnect => "transport_disconnect",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one node in one round
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeResult {
    /// No response yet
    Pending,
    Success { output: Payload },
    Failure { kind: FailureKind, detail: String },
}

impl NodeResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, NodeResult::Success { .. })
    }
}

/// How a round closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundDecision {
    /// Publish the aggregate as the next round's input
    Advance,
    /// The aggregate is the run's final result
    Finalize,
    /// Round abandoned; the run is failed or cancelled
    Abort,
}

// ============================================================================
// RUN / ROUND
// ============================================================================

/// A recorded failure, kept for diagnosis in run history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorRecord {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundNumber>,
    pub at: DateTime<Utc>,
}

/// One execution of a computation plugin across a consortium
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub consortium_id: ConsortiumId,
    pub image: ImageRef,
    pub parameters: Payload,
    /// Selected members, sorted
    pub members: Vec<NodeId>,
    pub status: RunStatus,
    pub current_round: RoundNumber,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<Payload>,
    pub errors: Vec<RunErrorRecord>,
    /// Nodes excluded so far; exclusion is permanent for the run
    pub excluded: BTreeSet<NodeId>,
    pub fingerprint: String,
}

/// One synchronized exchange between the coordinator and the active nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub run_id: RunId,
    pub number: RoundNumber,
    pub input: Payload,
    pub results: BTreeMap<NodeId, NodeResult>,
    pub deadline: DateTime<Utc>,
    pub decision: Option<RoundDecision>,
}

impl Round {
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.decision.is_some()
    }
}

/// Request fingerprint used for idempotent launch.
///
/// SHA-256 over the canonical JSON of the launch fields. Member order does not
/// matter; object keys are serialized sorted.
pub fn fingerprint(
    consortium_id: &ConsortiumId,
    image: &ImageRef,
    members: &[NodeId],
    parameters: &Payload,
) -> String {
    let mut members: Vec<&str> = members.iter().map(NodeId::as_str).collect();
    members.sort_unstable();
    let canonical = serde_json::json!({
        "consortiumId": consortium_id.as_str(),
        "imageRef": image.to_string(),
        "members": members,
        "parameters": parameters,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
