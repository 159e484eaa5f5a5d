//! Flame Transport - Addressable channel between coordinator and nodes
//!
//! This crate provides:
//! - The `Transport` trait (connect probe, request/reply, one-way notify)
//! - Timeouts and disconnects surfaced as explicit errors, never silent loss
//! - An in-process channel transport used by hosts and tests
//! - The retry policy (budget + exponential backoff with jitter)

pub mod channel;
pub mod error;
pub mod retry;
pub mod transport;

pub use channel::*;
pub use error::*;
pub use retry::*;
pub use transport::*;
