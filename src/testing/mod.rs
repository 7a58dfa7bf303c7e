//! Scenario test harness
//!
//! Loads YAML scenarios, spins up an isolated aggregator instance per
//! scenario, drives tool calls through the protocol client and judges each
//! response against its expectation.

pub mod client;
pub mod config;
pub mod expect;
pub mod instance;
pub mod loader;
pub mod preconfig;
pub mod protocol;
pub mod report;
pub mod result;
pub mod runner;

pub use config::*;
pub use instance::{Instance, InstanceManager, InstanceSettings};
pub use loader::{filter_scenarios, load_scenarios, ScenarioFilter};
pub use report::Reporter;
pub use result::{ScenarioResult, StepResult, SuiteResult, TestOutcome};
pub use runner::{RunConfig, Runner, Target};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

/// Sleep unless `cancel` fires first
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
