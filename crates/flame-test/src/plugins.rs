//! In-process stand-ins for computation plugins

use async_trait::async_trait;
use serde_json::json;

use flame_core::{FailureKind, Payload};
use flame_runtime::{Invocation, NodeExecutor, PluginFailure};
use flame_wire::parse_terminal_output;

/// Local statistics over a node's private samples.
///
/// Every round reports `{ "value": mean, "weight": count }`; only the
/// aggregate leaves the node.
#[derive(Clone, Debug)]
pub struct LocalStatsExecutor {
    samples: Vec<f64>,
}

impl LocalStatsExecutor {
    pub fn new(samples: Vec<f64>) -> Self {
        LocalStatsExecutor { samples }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

#[async_trait]
impl NodeExecutor for LocalStatsExecutor {
    async fn execute(&self, _invocation: &Invocation) -> Result<Payload, PluginFailure> {
        let mean = self
            .mean()
            .ok_or_else(|| PluginFailure::new(FailureKind::NonZeroExit, "no local samples"))?;
        Ok(json!({ "value": mean, "weight": self.samples.len() }))
    }
}

/// Emits fixed stdout, held to the same terminal-output rule as a real plugin
#[derive(Clone, Debug)]
pub struct StdoutExecutor {
    stdout: String,
}

impl StdoutExecutor {
    pub fn new(stdout: impl Into<String>) -> Self {
        StdoutExecutor {
            stdout: stdout.into(),
        }
    }
}

#[async_trait]
impl NodeExecutor for StdoutExecutor {
    async fn execute(&self, _invocation: &Invocation) -> Result<Payload, PluginFailure> {
        parse_terminal_output(self.stdout.as_bytes())
            .map_err(|e| PluginFailure::new(e.kind(), e.to_string()))
    }
}
