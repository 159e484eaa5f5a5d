//! Run leases: single-writer ownership per run
//!
//! A coordinator acquires the run's lease at provisioning, renews it every
//! round and releases it at a terminal status. Every append after
//! `RunCreated` must present the current, unexpired lease.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use flame_core::{FlameError, FlameResult, RunId};

/// Ownership token for one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLease {
    pub run_id: RunId,
    /// Coordinator instance holding the lease
    pub holder: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lease state of a single run
#[derive(Clone, Debug, Default)]
pub struct LeaseSlot {
    current: Option<RunLease>,
}

impl LeaseSlot {
    pub fn current(&self) -> Option<&RunLease> {
        self.current.as_ref()
    }

    /// Take the lease for `holder`.
    ///
    /// The same holder re-acquiring keeps its token and gets a fresh expiry.
    /// A different holder may only take over once the lease has expired.
    pub fn acquire(
        &mut self,
        run_id: &RunId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> FlameResult<RunLease> {
        let expires_at = now + to_chrono(ttl)?;
        let lease = match &self.current {
            Some(held) if held.holder == holder => RunLease {
                expires_at,
                ..held.clone()
            },
            Some(held) if !held.is_expired(now) => {
                return Err(FlameError::LeaseConflict {
                    run_id: run_id.clone(),
                    holder: held.holder.clone(),
                })
            }
            _ => RunLease {
                run_id: run_id.clone(),
                holder: holder.to_string(),
                token: Uuid::new_v4(),
                expires_at,
            },
        };
        self.current = Some(lease.clone());
        Ok(lease)
    }

    /// Check that `presented` is the live lease
    pub fn verify(&self, presented: &RunLease, now: DateTime<Utc>) -> FlameResult<()> {
        match &self.current {
            Some(held) if held.token == presented.token => {
                if held.is_expired(now) {
                    Err(FlameError::LeaseExpired(presented.run_id.clone()))
                } else {
                    Ok(())
                }
            }
            Some(held) if !held.is_expired(now) => Err(FlameError::LeaseConflict {
                run_id: presented.run_id.clone(),
                holder: held.holder.clone(),
            }),
            _ => Err(FlameError::LeaseExpired(presented.run_id.clone())),
        }
    }

    /// Extend a live lease
    pub fn renew(
        &mut self,
        presented: &RunLease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> FlameResult<RunLease> {
        self.verify(presented, now)?;
        let renewed = RunLease {
            expires_at: now + to_chrono(ttl)?,
            ..presented.clone()
        };
        self.current = Some(renewed.clone());
        Ok(renewed)
    }

    /// Drop the lease if `presented` still holds it
    pub fn release(&mut self, presented: &RunLease) -> bool {
        let held = matches!(&self.current, Some(l) if l.token == presented.token);
        if held {
            self.current = None;
        }
        held
    }
}

fn to_chrono(ttl: Duration) -> FlameResult<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| FlameError::Validation(format!("lease ttl out of range: {e}")))
}
