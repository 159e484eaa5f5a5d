//! Flame Core - Fundamental types for run orchestration
//!
//! This crate defines the types shared by every layer of the engine:
//! - Identifiers (RunId, ConsortiumId, NodeId) and image references
//! - Run lifecycle statuses and their monotonic ordering
//! - Consortium, Run, Round and NodeResult records
//! - The append-only run event vocabulary
//! - The error taxonomy

pub mod error;
pub mod event;
pub mod id;
pub mod image;
pub mod model;
pub mod status;

pub use error::*;
pub use event::*;
pub use id::*;
pub use image::*;
pub use model::*;
pub use status::*;

/// Opaque structured payload. Interpreted only by computation plugins and
/// their combination rules, forwarded verbatim by the engine.
pub type Payload = serde_json::Value;
