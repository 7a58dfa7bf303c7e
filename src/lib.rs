//! toolharness - scenario test harness for tool aggregator servers
//!
//! This library loads YAML test scenarios, runs each against an isolated
//! aggregator instance over the tool protocol, and reports results.

pub mod cli;
pub mod commands;
pub mod common;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
