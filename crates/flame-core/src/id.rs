//! Identity types for run orchestration
//!
//! Identifiers are issued outside the engine (the launcher UI for runs, the
//! identity service for nodes) and are treated as opaque strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Run identity - caller-supplied, doubles as the idempotency key for launch
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run({})", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        RunId::new(id)
    }
}

/// Consortium identity
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsortiumId(String);

impl ConsortiumId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        ConsortiumId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConsortiumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consortium({})", self.0)
    }
}

impl fmt::Display for ConsortiumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsortiumId {
    fn from(id: &str) -> Self {
        ConsortiumId::new(id)
    }
}

/// Node identity - a consortium member (user or vault) holding private data.
///
/// Ordering is lexicographic and is what makes aggregation order canonical.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId::new(id)
    }
}

/// Round number within a run, starting at 0
pub type RoundNumber = u64;

/// Per-run event sequence number, starting at 1
pub type Seq = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let run = RunId::new("run-1");
        let json = serde_json::to_string(&run).unwrap();
        assert_eq!(json, "\"run-1\"");

        let node: NodeId = serde_json::from_str("\"site-a\"").unwrap();
        assert_eq!(node, NodeId::new("site-a"));
    }

    #[test]
    fn test_node_ordering_is_lexicographic() {
        let mut nodes = vec![NodeId::new("c"), NodeId::new("a"), NodeId::new("b")];
        nodes.sort();
        assert_eq!(nodes, vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]);
    }

    #[test]
    fn test_blank_run_id_is_empty() {
        assert!(RunId::new("  ").is_empty());
        assert!(!RunId::new("r").is_empty());
    }
}
