//! Fault injection for simulated consortiums
//!
//! Two sources of faults, consulted per request attempt:
//! - A `FaultScript`: exact faults queued for a (node, round), consumed in order
//! - Random faults drawn from a seeded `ChaosConfig`
//!
//! Scripted faults win; random ones apply only when the script is empty.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flame_core::{FailureKind, NodeId, RoundNumber};

/// What happens to one request attempt
#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    /// No reply within the attempt timeout
    Timeout,
    /// Connection dropped
    Disconnect,
    /// The node runs the plugin, which fails
    PluginFailure { kind: FailureKind, detail: String },
    /// Reply arrives late; a delay past the attempt timeout is a timeout
    Delay(Duration),
    /// The request hangs and ignores the attempt timeout
    Stall,
}

impl Fault {
    pub fn plugin(kind: FailureKind, detail: impl Into<String>) -> Self {
        Fault::PluginFailure {
            kind,
            detail: detail.into(),
        }
    }

    pub fn delay_ms(ms: u64) -> Self {
        Fault::Delay(Duration::from_millis(ms))
    }
}

/// Faults queued per (node, round)
#[derive(Clone, Debug, Default)]
pub struct FaultScript {
    queued: HashMap<(NodeId, RoundNumber), VecDeque<Fault>>,
}

impl FaultScript {
    pub fn new() -> Self {
        FaultScript::default()
    }

    /// Queue faults for successive attempts at `node` in `round`
    pub fn push(&mut self, node: &NodeId, round: RoundNumber, faults: impl IntoIterator<Item = Fault>) {
        self.queued
            .entry((node.clone(), round))
            .or_default()
            .extend(faults);
    }

    /// Fault for the next attempt, if one is queued
    pub fn next(&mut self, node: &NodeId, round: RoundNumber) -> Option<Fault> {
        self.queued.get_mut(&(node.clone(), round))?.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.values().all(VecDeque::is_empty)
    }
}

/// Random fault rates
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Probability an attempt times out (0.0 - 1.0)
    pub timeout_rate: f64,
    /// Probability an attempt is disconnected
    pub disconnect_rate: f64,
    /// Probability the plugin fails
    pub plugin_failure_rate: f64,
    /// Upper bound of the random reply delay
    pub max_latency: Duration,
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig::calm()
    }
}

impl ChaosConfig {
    /// No random faults
    pub fn calm() -> Self {
        ChaosConfig {
            timeout_rate: 0.0,
            disconnect_rate: 0.0,
            plugin_failure_rate: 0.0,
            max_latency: Duration::ZERO,
            seed: 0,
        }
    }

    /// Occasional transient faults
    pub fn good() -> Self {
        ChaosConfig {
            timeout_rate: 0.02,
            disconnect_rate: 0.02,
            plugin_failure_rate: 0.0,
            max_latency: Duration::from_millis(20),
            seed: 0,
        }
    }

    /// Frequent transient faults and the odd plugin failure
    pub fn poor() -> Self {
        ChaosConfig {
            timeout_rate: 0.1,
            disconnect_rate: 0.1,
            plugin_failure_rate: 0.03,
            max_latency: Duration::from_millis(200),
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Fault injection statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub attempts: u64,
    pub scripted: u64,
    pub timeouts: u64,
    pub disconnects: u64,
    pub plugin_failures: u64,
    pub delayed: u64,
}

/// Decides the fault, if any, for each request attempt
pub struct Chaos {
    config: ChaosConfig,
    script: FaultScript,
    rng: StdRng,
    stats: ChaosStats,
}

impl Chaos {
    pub fn new(config: ChaosConfig, script: FaultScript) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Chaos {
            config,
            script,
            rng,
            stats: ChaosStats::default(),
        }
    }

    pub fn script_mut(&mut self) -> &mut FaultScript {
        &mut self.script
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Fault for the next attempt at `node` in `round`
    pub fn next_fault(&mut self, node: &NodeId, round: RoundNumber) -> Option<Fault> {
        self.stats.attempts += 1;
        let fault = match self.script.next(node, round) {
            Some(fault) => {
                self.stats.scripted += 1;
                Some(fault)
            }
            None => self.random_fault(),
        };
        match &fault {
            Some(Fault::Timeout | Fault::Stall) => self.stats.timeouts += 1,
            Some(Fault::Disconnect) => self.stats.disconnects += 1,
            Some(Fault::PluginFailure { .. }) => self.stats.plugin_failures += 1,
            Some(Fault::Delay(_)) => self.stats.delayed += 1,
            None => {}
        }
        fault
    }

    fn random_fault(&mut self) -> Option<Fault> {
        let roll: f64 = self.rng.gen();
        let mut threshold = self.config.timeout_rate;
        if roll < threshold {
            return Some(Fault::Timeout);
        }
        threshold += self.config.disconnect_rate;
        if roll < threshold {
            return Some(Fault::Disconnect);
        }
        threshold += self.config.plugin_failure_rate;
        if roll < threshold {
            return Some(Fault::plugin(FailureKind::NonZeroExit, "injected plugin failure"));
        }
        if self.config.max_latency.is_zero() {
            return None;
        }
        let ms = self.rng.gen_range(0..=self.config.max_latency.as_millis() as u64);
        (ms > 0).then(|| Fault::delay_ms(ms))
    }
}
