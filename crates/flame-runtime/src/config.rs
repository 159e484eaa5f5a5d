//! Orchestrator configuration

use std::time::Duration;

use flame_core::{FlameError, FlameResult, RoundNumber};
use flame_transport::RetryPolicy;

/// Coordinator-side configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Lease holder identity of this coordinator instance
    pub holder_id: String,
    /// Time allowed for one round; the full retry budget must fit inside it
    pub round_deadline: Duration,
    /// Time allowed for a single request/reply with a node
    pub attempt_timeout: Duration,
    /// Node-local execution timeout; must be shorter than one attempt
    pub execution_timeout: Duration,
    /// Time allowed for the reachability probe at launch
    pub provisioning_timeout: Duration,
    /// Lease lifetime; renewed at the start of every round
    pub lease_ttl: Duration,
    /// A run that would start this round fails instead
    pub max_rounds: RoundNumber,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            holder_id: format!("coordinator-{}", uuid::Uuid::new_v4()),
            round_deadline: Duration::from_secs(120),
            attempt_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(25),
            provisioning_timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(300),
            max_rounds: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Short timeouts for local simulation
    pub fn local() -> Self {
        OrchestratorConfig {
            round_deadline: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(2),
            execution_timeout: Duration::from_millis(1500),
            provisioning_timeout: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(60),
            retry: RetryPolicy::default()
                .with_backoff(Duration::from_millis(10), Duration::from_millis(100)),
            ..Default::default()
        }
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_round_deadline(mut self, deadline: Duration) -> Self {
        self.round_deadline = deadline;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = timeout;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: RoundNumber) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> FlameResult<()> {
        let invalid = |msg: String| Err(FlameError::Validation(msg));
        if self.holder_id.trim().is_empty() {
            return invalid("holder_id is empty".into());
        }
        for (name, value) in [
            ("round_deadline", self.round_deadline),
            ("attempt_timeout", self.attempt_timeout),
            ("execution_timeout", self.execution_timeout),
            ("provisioning_timeout", self.provisioning_timeout),
            ("lease_ttl", self.lease_ttl),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be non-zero"));
            }
        }
        if self.execution_timeout >= self.round_deadline {
            return invalid(format!(
                "execution_timeout ({}) must be shorter than round_deadline ({})",
                humantime::format_duration(self.execution_timeout),
                humantime::format_duration(self.round_deadline)
            ));
        }
        if self.execution_timeout >= self.attempt_timeout {
            return invalid(format!(
                "execution_timeout ({}) must be shorter than attempt_timeout ({})",
                humantime::format_duration(self.execution_timeout),
                humantime::format_duration(self.attempt_timeout)
            ));
        }
        // A node that times out on every attempt must still settle before the deadline
        let budget = self.retry.worst_case(self.attempt_timeout);
        if budget >= self.round_deadline {
            return invalid(format!(
                "retry budget of {} attempts ({}) must fit inside round_deadline ({})",
                self.retry.max_attempts(),
                humantime::format_duration(budget),
                humantime::format_duration(self.round_deadline)
            ));
        }
        if self.lease_ttl <= self.round_deadline {
            return invalid("lease_ttl must outlive a full round".into());
        }
        if self.max_rounds == 0 {
            return invalid("max_rounds must be at least 1".into());
        }
        Ok(())
    }
}
