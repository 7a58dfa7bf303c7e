//! Step, scenario and suite results

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use super::config::Category;
use super::protocol::CallToolResult;

/// Outcome of a step or scenario
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "PASSED",
            TestOutcome::Failed => "FAILED",
            TestOutcome::Skipped => "SKIPPED",
            TestOutcome::Error => "ERROR",
        }
    }

    /// Failed or Error
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed | TestOutcome::Error)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one step, including cleanup steps
#[derive(Serialize, Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    /// Tool name as written in the scenario
    pub tool: String,
    /// Advertised name the request resolved to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_tool: Option<String>,
    pub outcome: TestOutcome,
    pub attempts: u32,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Last response seen, even for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CallToolResult>,
    /// Transport error or unmet expectation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// Attempts beyond the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Output captured from an instance before its directory was removed
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct InstanceLogs {
    pub stdout: String,
    pub stderr: String,
}

impl InstanceLogs {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Result of one scenario
#[derive(Serialize, Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub category: Category,
    pub concept: String,
    pub outcome: TestOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_logs: Option<InstanceLogs>,
}

impl ScenarioResult {
    /// Empty result for `scenario`, to be filled in by the runner
    pub fn new(name: &str, category: Category, concept: &str) -> Self {
        Self {
            name: name.to_string(),
            category,
            concept: concept.to_string(),
            outcome: TestOutcome::Passed,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            steps: Vec::new(),
            cleanup: Vec::new(),
            error: None,
            instance_logs: None,
        }
    }

    /// Scenario that never started
    pub fn skipped(name: &str, category: Category, concept: &str, reason: &str) -> Self {
        Self {
            outcome: TestOutcome::Skipped,
            error: Some(reason.to_string()),
            ..Self::new(name, category, concept)
        }
    }
}

/// Aggregated result of a run
#[derive(Serialize, Debug, Clone)]
pub struct SuiteResult {
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub scenarios: Vec<ScenarioResult>,
}

impl SuiteResult {
    pub fn new(started_at: DateTime<Utc>, duration: Duration, scenarios: Vec<ScenarioResult>) -> Self {
        let count = |outcome: TestOutcome| scenarios.iter().filter(|s| s.outcome == outcome).count();
        Self {
            started_at,
            duration,
            total: scenarios.len(),
            passed: count(TestOutcome::Passed),
            failed: count(TestOutcome::Failed),
            errors: count(TestOutcome::Error),
            skipped: count(TestOutcome::Skipped),
            scenarios,
        }
    }

    /// True only when every scenario passed
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(name: &str, outcome: TestOutcome) -> ScenarioResult {
        ScenarioResult {
            outcome,
            ..ScenarioResult::new(name, Category::Behavioral, "workflow")
        }
    }

    #[test]
    fn test_suite_counts() {
        let suite = SuiteResult::new(
            Utc::now(),
            Duration::from_secs(1),
            vec![
                scenario("a", TestOutcome::Passed),
                scenario("b", TestOutcome::Failed),
                scenario("c", TestOutcome::Error),
                scenario("d", TestOutcome::Skipped),
                scenario("e", TestOutcome::Passed),
            ],
        );
        assert_eq!(suite.total, 5);
        assert_eq!(suite.passed, 2);
        assert_eq!(suite.failed, 1);
        assert_eq!(suite.errors, 1);
        assert_eq!(suite.skipped, 1);
        assert!(!suite.all_passed());

        let empty = SuiteResult::new(Utc::now(), Duration::ZERO, Vec::new());
        assert!(empty.all_passed());
    }

    #[test]
    fn test_serialized_shape() {
        let mut result = scenario("a", TestOutcome::Failed);
        result.duration = Duration::from_millis(1500);
        result.steps.push(StepResult {
            step_id: "one".to_string(),
            tool: "ping".to_string(),
            resolved_tool: Some("core_ping".to_string()),
            outcome: TestOutcome::Failed,
            attempts: 3,
            duration: Duration::from_millis(20),
            response: Some(CallToolResult::text("pong")),
            error: Some("response does not contain 'ok'".to_string()),
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "FAILED");
        assert_eq!(json["category"], "behavioral");
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["steps"][0]["attempts"], 3);
        assert_eq!(json["steps"][0]["resolved_tool"], "core_ping");
        assert!(json.get("cleanup").is_none());
        assert!(json.get("instance_logs").is_none());
        assert_eq!(result.steps[0].retries(), 2);
    }
}
