//! Flame Registry - Single source of truth for runs
//!
//! This crate provides:
//! - Event stores: in-memory and a synced JSON-lines journal
//! - Derived run and round views, rebuilt by folding the log
//! - Run-scoped leases enforcing a single writer per run
//! - The registry: `append_event` as the only mutation entry point,
//!   status queries, history and live subscription

pub mod lease;
pub mod registry;
pub mod store;
pub mod view;

pub use lease::*;
pub use registry::*;
pub use store::*;
pub use view::*;
