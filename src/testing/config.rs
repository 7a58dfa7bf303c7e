//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::preconfig::PreConfiguration;

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    /// Name of the test scenario, unique within a run
    pub name: String,
    /// Scenario category
    pub category: Category,
    /// Domain concept under test (e.g. "serviceclass", "workflow")
    pub concept: String,
    /// Optional description of what the test verifies
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form tags usable as filters
    #[serde(default)]
    pub tags: Vec<String>,
    /// The sequence of test steps to execute
    #[serde(default)]
    pub steps: Vec<TestStep>,
    /// Steps that revert side effects; always run after `steps`
    #[serde(default)]
    pub cleanup: Vec<TestStep>,
    /// Upper bound for steps plus cleanup; cleanup always gets at least one default step timeout
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
    /// Providers and definitions the instance must load at startup
    #[serde(default)]
    pub pre_configuration: Option<PreConfiguration>,
}

/// Scenario category
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Black-box behaviour as a user of the tools sees it
    Behavioral,
    /// Cross-component flows
    Integration,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Behavioral => "behavioral",
            Category::Integration => "integration",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "behavioral" => Ok(Category::Behavioral),
            "integration" => Ok(Category::Integration),
            other => Err(format!(
                "unknown category '{}'. Supported: behavioral, integration",
                other
            )),
        }
    }
}

/// A single tool invocation in the execution flow
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TestStep {
    /// Step identifier, reported in results
    #[serde(default)]
    pub id: String,
    /// Optional human description
    #[serde(default)]
    pub description: Option<String>,
    /// Logical tool name; resolved against the advertised names
    #[serde(default)]
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Expectations for the call outcome
    #[serde(default)]
    pub expected: TestExpectation,
    /// Retry policy while the expectation is unmet
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
}

/// Retry policy for a step
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    #[serde(default)]
    pub count: u32,
    /// Delay before the second attempt
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub delay: Duration,
    /// Multiplier applied to the delay after each attempt
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff_multiplier {
            Some(m) if m > 0.0 && attempt > 1 => {
                let factor = m.powi(attempt.saturating_sub(1) as i32);
                let secs = self.delay.as_secs_f64() * factor;
                if secs.is_finite() {
                    Duration::from_secs_f64(secs.min(3600.0))
                } else {
                    Duration::from_secs(3600)
                }
            }
            _ => self.delay,
        }
    }
}

/// Expectations for a step outcome
#[derive(Deserialize, Debug, Clone)]
pub struct TestExpectation {
    /// Whether the call should succeed
    #[serde(default = "default_true")]
    pub success: bool,
    /// Substrings the error text must contain (when failure is expected)
    #[serde(default)]
    pub error_contains: Vec<String>,
    /// Substrings the response text must contain
    #[serde(default)]
    pub contains: Vec<String>,
    /// Substrings the response text must not contain
    #[serde(default)]
    pub not_contains: Vec<String>,
    /// Dot-path to expected value checks against the JSON response
    #[serde(default)]
    pub json_path: BTreeMap<String, Value>,
}

impl Default for TestExpectation {
    fn default() -> Self {
        Self {
            success: true,
            error_contains: Vec::new(),
            contains: Vec::new(),
            not_contains: Vec::new(),
            json_path: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Durations are written as "500ms", "2s", "1m" or a bare number of seconds
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => crate::common::parse_duration(&text)
                .ok_or_else(|| E::custom(format!("invalid duration '{}'", text))),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?.into_duration()
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(deserializer)?
        .map(RawDuration::into_duration)
        .transpose()
}
