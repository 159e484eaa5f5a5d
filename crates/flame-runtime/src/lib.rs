//! Flame Runtime - Run orchestration engine
//!
//! This crate implements the run loop:
//! 1. Validate a launch request and create the run
//! 2. Acquire the run lease and probe contributors (provisioning)
//! 3. Per round: fan input out to active nodes, collect under a deadline
//! 4. Retry transient transport failures, exclude failed nodes
//! 5. Enforce quorum, combine results with the plugin's rule
//! 6. Advance, finalize, fail or cancel, recording every step
//!
//! Node-side execution (`ExecutorHost`, `CommandExecutor`) lives here too.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod launcher;
pub mod telemetry;

pub use aggregator::*;
pub use config::*;
pub use coordinator::*;
pub use executor::*;
pub use launcher::*;
pub use telemetry::*;
