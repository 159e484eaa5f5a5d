//! Runs over the channel transport, served by executor hosts

use std::sync::Arc;
use std::time::Duration;

use flame_core::{
    Consortium, FailureKind, ImageRef, NodeId, QuorumPolicy, RunEvent, RunId, RunStatus,
};
use flame_registry::RunRegistry;
use flame_runtime::{
    CommandExecutor, ExecutorHost, ExecutorHostConfig, NodeExecutor, OrchestratorConfig,
    RunLauncher,
};
use flame_test::{catalog, default_executor, site, CONSORTIUM, MEAN_IMAGE, OWNER};
use flame_transport::{ChannelTransport, Transport};
use flame_wire::{Envelope, InputBody, ResultBody};
use serde_json::json;

struct Cluster {
    registry: Arc<RunRegistry>,
    transport: ChannelTransport,
    launcher: RunLauncher,
    nodes: Vec<NodeId>,
}

fn cluster(nodes: usize, quorum: QuorumPolicy) -> Cluster {
    let registry = Arc::new(RunRegistry::new());
    let nodes: Vec<NodeId> = (0..nodes).map(site).collect();
    let consortium = Consortium::new(CONSORTIUM, OWNER, nodes.clone())
        .unwrap()
        .with_quorum(quorum);
    registry.register_consortium(consortium).unwrap();

    let transport = ChannelTransport::default();
    let launcher = RunLauncher::new(
        Arc::clone(&registry),
        Arc::new(transport.clone()),
        catalog(),
        OrchestratorConfig::local().with_holder_id("coordinator-a"),
    )
    .unwrap();
    Cluster {
        registry,
        transport,
        launcher,
        nodes,
    }
}

impl Cluster {
    fn serve<E: NodeExecutor>(&self, index: usize, executor: E) -> Arc<ExecutorHost<E>> {
        let host = Arc::new(ExecutorHost::new(executor, ExecutorHostConfig::default()));
        Arc::clone(&host).spawn(self.transport.register(site(index)));
        host
    }

    async fn run(&self, run_id: &str, parameters: serde_json::Value) -> flame_core::Run {
        let request = flame_runtime::LaunchRequest::new(
            run_id,
            CONSORTIUM,
            MEAN_IMAGE,
            self.nodes.clone(),
        )
        .with_parameters(parameters);
        self.launcher.launch_run(request).await.unwrap();
        self.launcher.wait_for_completion(&RunId::new(run_id)).await.unwrap()
    }
}

#[tokio::test]
async fn test_hosts_serve_every_round() {
    let cluster = cluster(3, QuorumPolicy::All);
    let hosts: Vec<_> = (0..3).map(|i| cluster.serve(i, default_executor(i))).collect();

    let run = cluster.run("run-1", json!({"rounds": 2})).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.as_ref().unwrap()["value"], json!(2.0));
    for host in &hosts {
        assert_eq!(host.stats().executions, 2);
        assert_eq!(host.stats().duplicates, 0);
    }

    // Redelivered input after the fact replays the cached result
    let input = InputBody {
        image: ImageRef::parse(MEAN_IMAGE).unwrap(),
        input: json!({"rounds": 2}),
        parameters: Some(json!({"rounds": 2})),
    };
    let envelope = Envelope::input(run.id.clone(), 0, &input).unwrap();
    let reply = cluster
        .transport
        .request(&site(0), envelope, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        reply.result_body().unwrap(),
        ResultBody::Success {
            output: json!({"value": 1.0, "weight": 2})
        }
    );
    assert_eq!(hosts[0].stats().executions, 2);
    assert_eq!(hosts[0].stats().duplicates, 1);
}

#[tokio::test]
async fn test_dropped_endpoint_is_unreachable() {
    let cluster = cluster(3, QuorumPolicy::AtLeast(2));
    cluster.serve(0, default_executor(0));
    cluster.serve(1, default_executor(1));
    drop(cluster.transport.register(site(2)));

    let run = cluster.run("run-1", json!({})).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.as_ref().unwrap()["value"], json!(1.5));

    let started = cluster.registry.history(&run.id).unwrap()[2].event.clone();
    assert_eq!(
        started,
        RunEvent::RunStarted {
            active: vec![site(0), site(1)],
            unreachable: vec![site(2)],
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_times_out() {
    let cluster = cluster(3, QuorumPolicy::AtLeast(2));
    cluster.serve(0, default_executor(0));
    cluster.serve(1, default_executor(1));
    // Accepts envelopes but never answers
    let _silent = cluster.transport.register(site(2));

    let run = cluster.run("run-1", json!({})).await;
    assert_eq!(run.status, RunStatus::Completed);

    let history = cluster.registry.history(&run.id).unwrap();
    let retries = history
        .iter()
        .filter(|e| matches!(e.event, RunEvent::NodeRetried { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(history.iter().any(|e| matches!(
        &e.event,
        RunEvent::NodeExcluded { node, kind: FailureKind::TransportTimeout, .. } if *node == site(2)
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_executor_host() {
    let cluster = cluster(2, QuorumPolicy::All);
    for i in 0..2 {
        let plugin = CommandExecutor::new("sh").with_args([
            "-c".to_string(),
            format!("cat >/dev/null; echo '{{\"value\": {}, \"weight\": 1}}'", i * 10),
        ]);
        cluster.serve(i, plugin);
    }

    let run = cluster.run("run-1", json!({})).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.as_ref().unwrap()["value"], json!(5.0));
}
