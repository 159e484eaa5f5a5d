//! Simulated consortium builder
//!
//! Builds a registry, a consortium of `site-N` nodes, a `ScriptedTransport`
//! serving them and a launcher wired to all three.

use std::collections::HashMap;
use std::sync::Arc;

use flame_core::{
    Consortium, ConsortiumId, FlameResult, MemberRole, NodeId, QuorumPolicy, Run, RunId,
};
use flame_registry::{EventStore, MemoryEventStore, RunRegistry};
use flame_runtime::{LaunchRequest, NodeExecutor, OrchestratorConfig, PluginManifest, RuleCatalog, RunLauncher};

use crate::{ChaosConfig, Fault, FaultScript, LocalStatsExecutor, ScriptedTransport};

pub const CONSORTIUM: &str = "consortium-1";
pub const OWNER: &str = "owner";
/// Weighted-mean plugin
pub const MEAN_IMAGE: &str = "stats/mean:1";
/// Concatenating plugin
pub const CONCAT_IMAGE: &str = "stats/concat:1";
/// Majority-vote plugin
pub const VOTE_IMAGE: &str = "stats/vote:1";

/// Node id of the `index`th simulated site
pub fn site(index: usize) -> NodeId {
    NodeId::new(format!("site-{index}"))
}

/// Catalog declaring the simulated plugins
pub fn catalog() -> RuleCatalog {
    RuleCatalog::new()
        .with_plugin("stats/mean", PluginManifest::new("weighted_average"))
        .with_plugin("stats/concat", PluginManifest::new("concatenate"))
        .with_plugin("stats/vote", PluginManifest::new("majority_vote"))
}

/// Builder for a simulated consortium
pub struct ConsortiumHarness {
    nodes: usize,
    quorum: QuorumPolicy,
    config: OrchestratorConfig,
    chaos: ChaosConfig,
    script: FaultScript,
    unreachable: Vec<NodeId>,
    observers: Vec<NodeId>,
    executors: HashMap<NodeId, Arc<dyn NodeExecutor>>,
}

impl Default for ConsortiumHarness {
    fn default() -> Self {
        ConsortiumHarness {
            nodes: 4,
            quorum: QuorumPolicy::All,
            config: OrchestratorConfig::local().with_holder_id("coordinator-a"),
            chaos: ChaosConfig::calm(),
            script: FaultScript::new(),
            unreachable: Vec::new(),
            observers: Vec::new(),
            executors: HashMap::new(),
        }
    }
}

impl ConsortiumHarness {
    pub fn new() -> Self {
        ConsortiumHarness::default()
    }

    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }

    /// Queue faults for successive attempts at `site-index` in `round`
    pub fn fault(mut self, index: usize, round: u64, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.script.push(&site(index), round, faults);
        self
    }

    pub fn unreachable(mut self, index: usize) -> Self {
        self.unreachable.push(site(index));
        self
    }

    pub fn observer(mut self, index: usize) -> Self {
        self.observers.push(site(index));
        self
    }

    /// Replace the default local-statistics executor of `site-index`
    pub fn executor(mut self, index: usize, executor: impl NodeExecutor) -> Self {
        self.executors.insert(site(index), Arc::new(executor));
        self
    }

    /// Build over an in-memory store
    pub fn build(self) -> FlameResult<Simulation> {
        self.build_on(MemoryEventStore::new())
    }

    /// Build over `store`
    pub fn build_on<S: EventStore>(mut self, store: S) -> FlameResult<Simulation<S>> {
        let registry = Arc::new(RunRegistry::open(store)?);
        let nodes: Vec<NodeId> = (0..self.nodes).map(site).collect();

        let mut consortium = Consortium::new(CONSORTIUM, OWNER, nodes.clone())?.with_quorum(self.quorum);
        for node in &self.observers {
            consortium = consortium.with_role(node.clone(), MemberRole::Observer);
        }
        registry.register_consortium(consortium)?;

        let transport = Arc::new(ScriptedTransport::new(self.chaos, self.script));
        for (index, node) in nodes.iter().enumerate() {
            let executor: Arc<dyn NodeExecutor> = match self.executors.remove(node) {
                Some(executor) => executor,
                None => Arc::new(default_executor(index)),
            };
            transport.add_node(node.clone(), executor);
        }
        for node in &self.unreachable {
            transport.set_reachable(node, false);
        }
        let observed = Arc::clone(&registry);
        transport.set_observer(Arc::new(move |run_id: &RunId| {
            observed.view(run_id).map(|view| view.last_seq).unwrap_or(0)
        }));

        let launcher = RunLauncher::new(
            Arc::clone(&registry),
            transport.clone(),
            catalog(),
            self.config.clone(),
        )?;
        Ok(Simulation {
            registry,
            launcher,
            transport,
            nodes,
            config: self.config,
        })
    }
}

/// `site-i` holds samples `{i, i + 2}`: mean `i + 1`, weight 2
pub fn default_executor(index: usize) -> LocalStatsExecutor {
    LocalStatsExecutor::new(vec![index as f64, (index + 2) as f64])
}

/// A built simulation
pub struct Simulation<S: EventStore = MemoryEventStore> {
    pub registry: Arc<RunRegistry<S>>,
    pub launcher: RunLauncher<S>,
    pub transport: Arc<ScriptedTransport>,
    pub nodes: Vec<NodeId>,
    config: OrchestratorConfig,
}

impl<S: EventStore> Simulation<S> {
    pub fn consortium_id(&self) -> ConsortiumId {
        ConsortiumId::new(CONSORTIUM)
    }

    /// Launch request for `run_id` over every node, as the owner
    pub fn request(&self, run_id: &str) -> LaunchRequest {
        LaunchRequest::new(run_id, CONSORTIUM, MEAN_IMAGE, self.nodes.clone()).with_caller(OWNER)
    }

    /// Another launcher on the same registry and transport, as a different holder
    pub fn launcher_as(&self, holder_id: &str) -> FlameResult<RunLauncher<S>> {
        RunLauncher::new(
            Arc::clone(&self.registry),
            self.transport.clone(),
            catalog(),
            self.config.clone().with_holder_id(holder_id),
        )
    }

    /// Launch and wait for the run's final state
    pub async fn run_to_end(&self, request: LaunchRequest) -> FlameResult<Run> {
        let run_id = request.run_id.clone();
        self.launcher.launch_run(request).await?;
        self.launcher.wait_for_completion(&run_id).await
    }
}
