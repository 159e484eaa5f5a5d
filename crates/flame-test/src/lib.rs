//! Flame Test Harness - Simulated consortiums and fault injection
//!
//! This crate provides:
//! - Scripted and seeded random faults per (node, round)
//! - A transport delivering envelopes to in-process executors
//! - Local-statistics stand-ins for computation plugins
//! - A builder wiring registry, consortium, transport and launcher

pub mod chaos;
pub mod harness;
pub mod plugins;
pub mod simulator;

pub use chaos::*;
pub use harness::*;
pub use plugins::*;
pub use simulator::*;
