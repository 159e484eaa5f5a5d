//! Node-side execution
//!
//! `NodeExecutor` runs one round of the computation plugin on local data.
//! `ExecutorHost` serves a transport endpoint on behalf of an executor:
//! - duplicate `input` for a (run, round) never re-executes; completed rounds
//!   are answered from a bounded cache, in-flight ones join the running task
//! - `abort` cancels in-flight work for the run
//! - the local execution timeout yields `ExecutionTimeout`
//!
//! `CommandExecutor` runs a configured program with the invocation on stdin.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};

use flame_core::{FailureKind, FlameResult, ImageRef, NodeId, Payload, RoundNumber, RunId};
use flame_transport::{Inbound, NodeEndpoint};
use flame_wire::{parse_terminal_output, Envelope, MessageKind, ResultBody};

use crate::fmt_duration;

/// Bytes of stderr kept in a `NonZeroExit` detail
const STDERR_TAIL: usize = 512;

/// One round of work for a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub run_id: RunId,
    pub round: RoundNumber,
    pub image: ImageRef,
    pub input: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Payload>,
}

impl Invocation {
    pub fn from_envelope(envelope: &Envelope) -> FlameResult<Self> {
        let body = envelope.input_body()?;
        Ok(Invocation {
            run_id: envelope.run_id.clone(),
            round: envelope.round,
            image: body.image,
            input: body.input,
            parameters: body.parameters,
        })
    }

    /// The document handed to the plugin
    pub fn to_json(&self) -> Payload {
        serde_json::to_value(self).unwrap_or(Payload::Null)
    }
}

/// A plugin-level failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl PluginFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        PluginFailure {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<PluginFailure> for ResultBody {
    fn from(failure: PluginFailure) -> Self {
        ResultBody::Failure {
            kind: failure.kind,
            detail: failure.detail,
        }
    }
}

/// Runs the computation plugin for one round on local data
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    async fn execute(&self, invocation: &Invocation) -> Result<Payload, PluginFailure>;
}

// ============================================================================
// EXECUTOR HOST
// ============================================================================

/// Executor host configuration
#[derive(Clone, Debug)]
pub struct ExecutorHostConfig {
    /// Local execution timeout, shorter than the coordinator's round deadline
    pub execution_timeout: Duration,
    /// Completed (run, round) results kept for duplicate inputs
    pub cache_capacity: usize,
}

impl Default for ExecutorHostConfig {
    fn default() -> Self {
        ExecutorHostConfig {
            execution_timeout: Duration::from_secs(45),
            cache_capacity: 64,
        }
    }
}

impl ExecutorHostConfig {
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }
}

/// Executor host statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Executions started
    pub executions: u64,
    /// Inputs answered without executing
    pub duplicates: u64,
    /// Executions cancelled by `abort`
    pub aborted: u64,
}

type SlotKey = (RunId, RoundNumber);

enum Slot {
    Running {
        /// Execution that owns the slot
        execution: u64,
        waiters: Vec<Inbound>,
        task: AbortHandle,
    },
    Done(ResultBody),
}

#[derive(Default)]
struct HostState {
    slots: HashMap<SlotKey, Slot>,
    /// Completion order, for cache eviction
    completed: VecDeque<SlotKey>,
    next_execution: u64,
    stats: HostStats,
}

/// Serves a node's transport endpoint with a `NodeExecutor`
pub struct ExecutorHost<E: NodeExecutor> {
    executor: Arc<E>,
    config: ExecutorHostConfig,
    state: Mutex<HostState>,
}

impl<E: NodeExecutor> ExecutorHost<E> {
    pub fn new(executor: E, config: ExecutorHostConfig) -> Self {
        ExecutorHost {
            executor: Arc::new(executor),
            config,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    /// Serve `endpoint` until the transport drops it
    pub fn spawn(self: Arc<Self>, mut endpoint: NodeEndpoint) -> JoinHandle<()> {
        tokio::spawn(async move {
            let node = endpoint.node().clone();
            while let Some(inbound) = endpoint.recv().await {
                self.handle(&node, inbound);
            }
            tracing::debug!(node = %node, "executor endpoint closed");
        })
    }

    fn handle(self: &Arc<Self>, node: &NodeId, inbound: Inbound) {
        match inbound.envelope.kind {
            MessageKind::Input => self.on_input(node, inbound),
            MessageKind::Abort => self.on_abort(node, &inbound.envelope.run_id),
            MessageKind::Result => {
                tracing::warn!(node = %node, run_id = %inbound.envelope.run_id, "ignoring result envelope sent to executor");
            }
        }
    }

    fn on_input(self: &Arc<Self>, node: &NodeId, inbound: Inbound) {
        let run_id = inbound.envelope.run_id.clone();
        let round = inbound.envelope.round;
        let invocation = match Invocation::from_envelope(&inbound.envelope) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(node = %node, run_id = %run_id, round, "undecodable input: {}", e);
                let body = PluginFailure::new(FailureKind::MalformedOutput, format!("undecodable input: {e}"));
                respond(node, inbound, &ResultBody::from(body));
                return;
            }
        };

        let key = (run_id, round);
        let mut state = self.state.lock();
        match state.slots.get_mut(&key) {
            Some(Slot::Done(body)) => {
                let body = body.clone();
                state.stats.duplicates += 1;
                drop(state);
                tracing::debug!(node = %node, run_id = %key.0, round, "duplicate input, replaying cached result");
                respond(node, inbound, &body);
                return;
            }
            Some(Slot::Running { waiters, .. }) => {
                waiters.push(inbound);
                state.stats.duplicates += 1;
                tracing::debug!(node = %node, run_id = %key.0, round, "duplicate input joins running execution");
                return;
            }
            None => {}
        }

        state.stats.executions += 1;
        state.next_execution += 1;
        let execution = state.next_execution;
        let host = Arc::clone(self);
        let task_key = key.clone();
        let task_node = node.clone();
        // The slot lock is held until the slot exists, so `finish` cannot run first.
        let task = tokio::spawn(async move {
            let body = host.run(&task_node, &invocation).await;
            host.finish(&task_node, task_key, execution, body);
        });
        state.slots.insert(
            key,
            Slot::Running {
                execution,
                waiters: vec![inbound],
                task: task.abort_handle(),
            },
        );
    }

    async fn run(&self, node: &NodeId, invocation: &Invocation) -> ResultBody {
        let timeout = self.config.execution_timeout;
        match tokio::time::timeout(timeout, self.executor.execute(invocation)).await {
            Ok(Ok(output)) => ResultBody::Success { output },
            Ok(Err(failure)) => {
                tracing::info!(
                    node = %node,
                    run_id = %invocation.run_id,
                    round = invocation.round,
                    kind = %failure.kind,
                    "plugin failed: {}",
                    failure.detail
                );
                failure.into()
            }
            Err(_) => {
                tracing::info!(node = %node, run_id = %invocation.run_id, round = invocation.round, "plugin timed out");
                PluginFailure::new(
                    FailureKind::ExecutionTimeout,
                    format!("no result within {}", fmt_duration(timeout)),
                )
                .into()
            }
        }
    }

    fn finish(&self, node: &NodeId, key: SlotKey, execution: u64, body: ResultBody) {
        let waiters = {
            let mut state = self.state.lock();
            // An aborted execution can still get here after the round was re-run
            let owns_slot = matches!(
                state.slots.get(&key),
                Some(Slot::Running { execution: owner, .. }) if *owner == execution
            );
            if !owns_slot {
                tracing::debug!(node = %node, run_id = %key.0, round = key.1, "discarding result of superseded execution");
                return;
            }
            let waiters = match state.slots.insert(key.clone(), Slot::Done(body.clone())) {
                Some(Slot::Running { waiters, .. }) => waiters,
                _ => Vec::new(),
            };
            state.completed.retain(|done| *done != key);
            state.completed.push_back(key);
            while state.completed.len() > self.config.cache_capacity {
                if let Some(evicted) = state.completed.pop_front() {
                    state.slots.remove(&evicted);
                }
            }
            waiters
        };
        for inbound in waiters {
            respond(node, inbound, &body);
        }
    }

    fn on_abort(&self, node: &NodeId, run_id: &RunId) {
        let mut state = self.state.lock();
        let running: Vec<SlotKey> = state
            .slots
            .iter()
            .filter(|(key, slot)| key.0 == *run_id && matches!(slot, Slot::Running { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &running {
            if let Some(Slot::Running { task, .. }) = state.slots.remove(key) {
                task.abort();
            }
        }
        state.stats.aborted += running.len() as u64;
        tracing::debug!(node = %node, run_id = %run_id, cancelled = running.len(), "abort received");
    }
}

fn respond(node: &NodeId, inbound: Inbound, body: &ResultBody) {
    let envelope = &inbound.envelope;
    let reply = Envelope::result(envelope.run_id.clone(), envelope.round, body)
        .and_then(|reply| inbound.respond(&reply));
    if let Err(e) = reply {
        tracing::warn!(node = %node, "failed to send result: {}", e);
    }
}

// ============================================================================
// COMMAND EXECUTOR
// ============================================================================

/// Runs a program per invocation.
///
/// The invocation JSON is written to stdin; the program must exit zero and
/// print exactly one JSON object. `{image}` in an argument is replaced by the
/// image reference, e.g. `docker run -i --rm {image}`.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        CommandExecutor {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let image = invocation.image.to_string();
        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|arg| arg.replace("{image}", &image)))
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl NodeExecutor for CommandExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<Payload, PluginFailure> {
        let stdin_doc = serde_json::to_vec(invocation)
            .map_err(|e| PluginFailure::new(FailureKind::MalformedOutput, format!("cannot encode invocation: {e}")))?;

        let mut child = self.command(invocation).spawn().map_err(|e| {
            PluginFailure::new(
                FailureKind::NonZeroExit,
                format!("failed to start {}: {e}", self.program),
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A plugin that ignores stdin closes the pipe early; that is fine.
            tokio::spawn(async move {
                let _ = stdin.write_all(&stdin_doc).await;
            });
        }

        let output = child.wait_with_output().await.map_err(|e| {
            PluginFailure::new(FailureKind::NonZeroExit, format!("wait failed: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut tail_start = stderr.len().saturating_sub(STDERR_TAIL);
            while !stderr.is_char_boundary(tail_start) {
                tail_start += 1;
            }
            return Err(PluginFailure::new(
                FailureKind::NonZeroExit,
                format!("{}: {}", output.status, stderr[tail_start..].trim()),
            ));
        }

        parse_terminal_output(&output.stdout)
            .map_err(|e| PluginFailure::new(e.kind(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flame_transport::{ChannelTransport, Transport, TransportError};
    use flame_wire::InputBody;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl NodeExecutor for Counting {
        async fn execute(&self, invocation: &Invocation) -> Result<Payload, PluginFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(json!({"round": invocation.round, "echo": invocation.input}))
        }
    }

    fn input(run: &str, round: RoundNumber) -> Envelope {
        let body = InputBody {
            image: ImageRef::parse("stats/mean:1").unwrap(),
            input: json!({"x": 1}),
            parameters: None,
        };
        Envelope::input(RunId::new(run), round, &body).unwrap()
    }

    fn serve(delay: Duration, config: ExecutorHostConfig) -> (ChannelTransport, Arc<ExecutorHost<Counting>>, Arc<AtomicUsize>) {
        let transport = ChannelTransport::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let host = Arc::new(ExecutorHost::new(
            Counting {
                calls: Arc::clone(&calls),
                delay,
            },
            config,
        ));
        Arc::clone(&host).spawn(transport.register("site-a"));
        (transport, host, calls)
    }

    #[tokio::test]
    async fn test_duplicate_input_replays_cached_result() {
        let (transport, host, calls) = serve(Duration::ZERO, ExecutorHostConfig::default());
        let node = NodeId::new("site-a");

        let first = transport.request(&node, input("r", 0), Duration::from_secs(1)).await.unwrap();
        let second = transport.request(&node, input("r", 0), Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.stats().duplicates, 1);

        transport.request(&node, input("r", 1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_while_running_joins_execution() {
        let (transport, host, calls) = serve(Duration::from_millis(500), ExecutorHostConfig::default());
        let node = NodeId::new("site-a");

        let (a, b) = tokio::join!(
            transport.request(&node, input("r", 0), Duration::from_secs(2)),
            transport.request(&node, input("r", 0), Duration::from_secs(2)),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.stats().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout() {
        let config = ExecutorHostConfig::default().with_execution_timeout(Duration::from_millis(100));
        let (transport, _host, _calls) = serve(Duration::from_secs(10), config);

        let reply = transport
            .request(&NodeId::new("site-a"), input("r", 0), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            reply.result_body().unwrap(),
            ResultBody::Failure { kind: FailureKind::ExecutionTimeout, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_running_work() {
        let (transport, host, _calls) = serve(Duration::from_secs(10), ExecutorHostConfig::default());
        let node = NodeId::new("site-a");

        let pending = {
            let transport = transport.clone();
            let node = node.clone();
            tokio::spawn(async move { transport.request(&node, input("r", 0), Duration::from_secs(5)).await })
        };
        while host.stats().executions == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        transport.notify(&node, Envelope::abort(RunId::new("r"), 0)).await.unwrap();

        let result = pending.await.unwrap();
        assert_eq!(result, Err(TransportError::Disconnected { node }));
        assert_eq!(host.stats().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_after_abort_is_cached() {
        let (transport, host, calls) = serve(Duration::from_secs(10), ExecutorHostConfig::default());
        let node = NodeId::new("site-a");

        let aborted = {
            let transport = transport.clone();
            let node = node.clone();
            tokio::spawn(async move { transport.request(&node, input("r", 0), Duration::from_secs(30)).await })
        };
        while host.stats().executions == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        transport.notify(&node, Envelope::abort(RunId::new("r"), 0)).await.unwrap();
        assert!(aborted.await.unwrap().is_err());

        let rerun = transport.request(&node, input("r", 0), Duration::from_secs(30)).await.unwrap();
        let replay = transport.request(&node, input("r", 0), Duration::from_secs(30)).await.unwrap();
        assert_eq!(rerun, replay);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(host.stats().duplicates, 1);
        assert_eq!(host.state.lock().completed.len(), 1);
    }

    #[tokio::test]
    async fn test_superseded_execution_is_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = ExecutorHost::new(
            Counting { calls, delay: Duration::ZERO },
            ExecutorHostConfig::default(),
        );
        let node = NodeId::new("site-a");
        let key = (RunId::new("r"), 0);
        let task = tokio::spawn(async {}).abort_handle();
        host.state.lock().slots.insert(
            key.clone(),
            Slot::Running {
                execution: 2,
                waiters: Vec::new(),
                task,
            },
        );

        host.finish(&node, key.clone(), 1, ResultBody::Success { output: json!({"stale": true}) });
        assert!(matches!(host.state.lock().slots.get(&key), Some(Slot::Running { .. })));
        assert!(host.state.lock().completed.is_empty());

        let fresh = ResultBody::Success { output: json!({"fresh": true}) };
        host.finish(&node, key.clone(), 2, fresh.clone());
        let state = host.state.lock();
        assert!(matches!(state.slots.get(&key), Some(Slot::Done(body)) if *body == fresh));
        assert_eq!(state.completed, VecDeque::from([key]));
    }

    #[tokio::test]
    async fn test_bad_input_is_reported() {
        let (transport, _host, calls) = serve(Duration::ZERO, ExecutorHostConfig::default());
        let mut envelope = input("r", 0);
        envelope.payload = json!({"unexpected": true});

        let reply = transport
            .request(&NodeId::new("site-a"), envelope, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            reply.result_body().unwrap(),
            ResultBody::Failure { kind: FailureKind::MalformedOutput, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invocation_json() {
        let invocation = Invocation::from_envelope(&input("r", 3)).unwrap();
        let doc = invocation.to_json();
        assert_eq!(doc["runId"], json!("r"));
        assert_eq!(doc["round"], json!(3));
        assert_eq!(doc["image"], json!("stats/mean:1"));
        assert!(doc.get("parameters").is_none());
    }

    #[cfg(unix)]
    mod command {
        use super::*;

        fn invocation() -> Invocation {
            Invocation::from_envelope(&input("r", 0)).unwrap()
        }

        fn sh(script: &str) -> CommandExecutor {
            CommandExecutor::new("sh").with_args(["-c", script])
        }

        #[tokio::test]
        async fn test_stdin_carries_invocation() {
            let output = sh("cat").execute(&invocation()).await.unwrap();
            assert_eq!(output, invocation().to_json());
        }

        #[tokio::test]
        async fn test_image_placeholder_and_env() {
            let executor = sh("printf '{\"image\": \"%s\", \"mode\": \"%s\"}' \"$0\" \"$MODE\"")
                .with_arg("{image}")
                .with_env("MODE", "local");
            let output = executor.execute(&invocation()).await.unwrap();
            assert_eq!(output, json!({"image": "stats/mean:1", "mode": "local"}));
        }

        #[tokio::test]
        async fn test_non_zero_exit() {
            let err = sh("echo boom >&2; exit 3").execute(&invocation()).await.unwrap_err();
            assert_eq!(err.kind, FailureKind::NonZeroExit);
            assert!(err.detail.contains("boom"));
        }

        #[tokio::test]
        async fn test_malformed_output() {
            let err = sh("echo '{\"a\": 1}'; echo '{\"b\": 2}'").execute(&invocation()).await.unwrap_err();
            assert_eq!(err.kind, FailureKind::MalformedOutput);

            let err = sh("echo not json").execute(&invocation()).await.unwrap_err();
            assert_eq!(err.kind, FailureKind::MalformedOutput);
        }

        #[tokio::test]
        async fn test_missing_program() {
            let err = CommandExecutor::new("/nonexistent/plugin")
                .execute(&invocation())
                .await
                .unwrap_err();
            assert_eq!(err.kind, FailureKind::NonZeroExit);
        }
    }
}
