//! Transport envelope
//!
//! Envelope = `{ runId, round, kind: "input"|"result"|"abort", payload }`.
//! Input payloads carry the image reference and round input (plus the
//! computation parameters on round 0); result payloads carry the node outcome.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use flame_core::{
    FailureKind, FlameError, FlameResult, ImageRef, NodeResult, Payload, RoundNumber, RunId,
};

/// Maximum encoded envelope size
pub const MAX_ENVELOPE_SIZE: usize = 4 * 1024 * 1024;

/// Envelope kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Input,
    Result,
    Abort,
}

/// A message between the coordinator and one node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub run_id: RunId,
    pub round: RoundNumber,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Payload,
}

/// Body of an `input` envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBody {
    pub image: ImageRef,
    pub input: Payload,
    /// Present on round 0 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Payload>,
}

/// Body of a `result` envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultBody {
    Success { output: Payload },
    Failure { kind: FailureKind, detail: String },
}

impl From<ResultBody> for NodeResult {
    fn from(body: ResultBody) -> Self {
        match body {
            ResultBody::Success { output } => NodeResult::Success { output },
            ResultBody::Failure { kind, detail } => NodeResult::Failure { kind, detail },
        }
    }
}

impl Envelope {
    /// Round input for one node
    pub fn input(run_id: RunId, round: RoundNumber, body: &InputBody) -> FlameResult<Self> {
        Ok(Envelope {
            run_id,
            round,
            kind: MessageKind::Input,
            payload: serde_json::to_value(body)?,
        })
    }

    /// A node's reply to an input
    pub fn result(run_id: RunId, round: RoundNumber, body: &ResultBody) -> FlameResult<Self> {
        Ok(Envelope {
            run_id,
            round,
            kind: MessageKind::Result,
            payload: serde_json::to_value(body)?,
        })
    }

    /// Best-effort cancellation of in-flight work for the run
    pub fn abort(run_id: RunId, round: RoundNumber) -> Self {
        Envelope {
            run_id,
            round,
            kind: MessageKind::Abort,
            payload: Payload::Null,
        }
    }

    pub fn input_body(&self) -> FlameResult<InputBody> {
        self.expect_kind(MessageKind::Input)?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn result_body(&self) -> FlameResult<ResultBody> {
        self.expect_kind(MessageKind::Result)?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn expect_kind(&self, kind: MessageKind) -> FlameResult<()> {
        if self.kind != kind {
            return Err(FlameError::InvalidWireFormat(format!(
                "expected {kind:?} envelope, got {:?}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Encode to JSON bytes
    pub fn encode(&self) -> FlameResult<Bytes> {
        let buf = serde_json::to_vec(self)?;
        if buf.len() > MAX_ENVELOPE_SIZE {
            return Err(FlameError::InvalidWireFormat(format!(
                "envelope of {} bytes exceeds {MAX_ENVELOPE_SIZE}",
                buf.len()
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Decode from JSON bytes
    pub fn decode(buf: &[u8]) -> FlameResult<Self> {
        if buf.len() > MAX_ENVELOPE_SIZE {
            return Err(FlameError::InvalidWireFormat(format!(
                "envelope of {} bytes exceeds {MAX_ENVELOPE_SIZE}",
                buf.len()
            )));
        }
        Ok(serde_json::from_slice(buf)?)
    }
}
