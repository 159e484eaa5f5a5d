//! Flame Wire - Message contract between coordinator and nodes
//!
//! This crate implements the wire format the engine speaks:
//! - Transport envelope `{ runId, round, kind, payload }` (JSON)
//! - Round input and result bodies carried in the payload
//! - The executor's terminal-output rule (exactly one JSON object)

pub mod envelope;
pub mod output;

pub use envelope::*;
pub use output::*;
