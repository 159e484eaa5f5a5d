//! Run lifecycle status
//!
//! Statuses are ranked: Created < Provisioning < Running < terminal.
//! The three terminal statuses share a rank and nothing follows them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Run status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Created,
    Provisioning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Position in the lifecycle ordering
    #[inline]
    pub fn rank(self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Provisioning => 1,
            RunStatus::Running => 2,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => 3,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Active runs pin their consortium's member set
    #[inline]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is reachable from `self` without going backwards.
    ///
    /// Skipping forward is allowed (a run can fail straight from Created);
    /// staying in place or leaving a terminal status is not.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "Created",
            RunStatus::Provisioning => "Provisioning",
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
