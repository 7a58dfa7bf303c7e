//! Scenario execution
//!
//! Scenarios run sequentially or on a bounded worker pool. Every scenario
//! that creates an instance tears it down again on its own bounded budget,
//! whatever happened before. Results come back in input order.

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::common::config::Timeouts;
use crate::common::Error;

use super::client::ToolClient;
use super::config::{TestScenario, TestStep};
use super::expect::check_expectation;
use super::instance::{Instance, InstanceManager};
use super::loader::{filter_scenarios, ScenarioFilter};
use super::protocol::CallToolResult;
use super::report::{Reporter, RunEvent, RunSummary};
use super::result::{ScenarioResult, StepResult, SuiteResult, TestOutcome};
use super::sleep_or_cancel;

/// Upper bound on concurrent scenarios
pub const MAX_PARALLEL: usize = 10;

/// Where scenarios send their tool calls
#[derive(Clone)]
pub enum Target {
    /// Spawn one instance per scenario
    Managed(Arc<InstanceManager>),
    /// Use an already running server; pre-configuration is ignored
    External(String),
}

/// Run options
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub filter: ScenarioFilter,
    pub parallel: usize,
    pub fail_fast: bool,
    pub timeouts: Timeouts,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            filter: ScenarioFilter::default(),
            parallel: 1,
            fail_fast: false,
            timeouts: Timeouts::default(),
        }
    }
}

/// Executes scenarios against a target
#[derive(Clone)]
pub struct Runner {
    target: Target,
    config: Arc<RunConfig>,
}

type Events = mpsc::UnboundedSender<RunEvent>;

impl Runner {
    pub fn new(target: Target, config: RunConfig) -> Self {
        Self {
            target,
            config: Arc::new(config),
        }
    }

    /// Worker count actually used for `count` scenarios
    pub fn effective_parallel(&self, count: usize) -> usize {
        match self.target {
            // A shared external server cannot isolate concurrent scenarios
            Target::External(_) => 1,
            Target::Managed(_) => self.config.parallel.clamp(1, MAX_PARALLEL).min(count.max(1)),
        }
    }

    /// Filter, run and report `scenarios`
    pub async fn run(
        &self,
        scenarios: &[TestScenario],
        reporter: &mut Reporter,
        cancel: CancellationToken,
    ) -> SuiteResult {
        let selected: Vec<Arc<TestScenario>> = filter_scenarios(scenarios, &self.config.filter)
            .into_iter()
            .map(Arc::new)
            .collect();
        let parallel = self.effective_parallel(selected.len());

        let summary = RunSummary {
            scenarios: selected.len(),
            parallel,
            fail_fast: self.config.fail_fast,
            endpoint: match &self.target {
                Target::External(endpoint) => Some(endpoint.clone()),
                Target::Managed(_) => None,
            },
        };
        let listed: Vec<TestScenario> = selected.iter().map(|s| (**s).clone()).collect();
        reporter.on_run_start(&listed, &summary);

        let started_at = Utc::now();
        let started = Instant::now();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = self.clone();
        let worker_cancel = cancel.clone();
        let run_one = move |scenario: Arc<TestScenario>| {
            let runner = runner.clone();
            let events = tx.clone();
            let cancel = worker_cancel.clone();
            async move { runner.run_scenario(&scenario, &events, &cancel).await }
        };

        let running = dispatch(selected, parallel, self.config.fail_fast, cancel.clone(), run_one);
        let forward = async {
            while let Some(event) = rx.recv().await {
                reporter.handle(event);
            }
        };
        let (results, ()) = tokio::join!(running, forward);

        if let Target::Managed(manager) = &self.target {
            manager.destroy_all().await;
        }

        let suite = SuiteResult::new(started_at, started.elapsed(), results);
        if let Err(e) = reporter.on_suite_result(&suite) {
            tracing::warn!(error = %e, "Failed to write report");
        }
        suite
    }

    /// Run one scenario end to end, including instance setup and teardown
    pub async fn run_scenario(
        &self,
        scenario: &TestScenario,
        events: &Events,
        cancel: &CancellationToken,
    ) -> ScenarioResult {
        let _ = events.send(RunEvent::ScenarioStarted {
            name: scenario.name.clone(),
        });
        let started = Instant::now();
        let mut result = ScenarioResult::new(&scenario.name, scenario.category, &scenario.concept);

        match &self.target {
            Target::External(endpoint) => {
                if scenario.pre_configuration.is_some() {
                    tracing::warn!(
                        scenario = %scenario.name,
                        "Ignoring pre_configuration: running against an external endpoint"
                    );
                }
                match ToolClient::http(endpoint.as_str(), self.config.timeouts.step()) {
                    Ok(mut client) => {
                        self.drive(scenario, &mut client, &mut result, events, cancel).await;
                        client.close().await;
                    }
                    Err(e) => fail_with(&mut result, TestOutcome::Error, e.to_string()),
                }
            }
            Target::Managed(manager) => {
                match manager
                    .create_instance(&scenario.name, scenario.pre_configuration.as_ref())
                    .await
                {
                    Ok(instance) => {
                        let guard = TeardownGuard::new(manager.clone(), &instance.id);
                        self.drive_instance(manager, &instance, scenario, &mut result, events, cancel)
                            .await;
                        result.instance_logs = guard.teardown(self.config.timeouts.teardown()).await;
                    }
                    Err(e) => fail_with(&mut result, TestOutcome::Error, e.to_string()),
                }
            }
        }

        result.duration = started.elapsed();
        tracing::info!(
            scenario = %scenario.name,
            outcome = %result.outcome,
            duration_ms = result.duration.as_millis() as u64,
            "Scenario finished"
        );
        let _ = events.send(RunEvent::ScenarioFinished(Box::new(result.clone())));
        result
    }

    async fn drive_instance(
        &self,
        manager: &InstanceManager,
        instance: &Instance,
        scenario: &TestScenario,
        result: &mut ScenarioResult,
        events: &Events,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = manager.wait_for_ready(instance, cancel).await {
            fail_with(result, TestOutcome::Error, e.to_string());
            return;
        }
        let mut client = match ToolClient::http(instance.endpoint.as_str(), self.config.timeouts.step()) {
            Ok(client) => client,
            Err(e) => return fail_with(result, TestOutcome::Error, e.to_string()),
        };
        self.drive(scenario, &mut client, result, events, cancel).await;
        client.close().await;
    }

    async fn drive(
        &self,
        scenario: &TestScenario,
        client: &mut ToolClient,
        result: &mut ScenarioResult,
        events: &Events,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = client.connect().await {
            return fail_with(result, TestOutcome::Error, e.to_string());
        }
        let executed = execute_scenario(scenario, client, &self.config.timeouts, events, cancel).await;
        result.outcome = executed.outcome;
        result.steps = executed.steps;
        result.cleanup = executed.cleanup;
        if result.error.is_none() {
            result.error = executed.error;
        }
    }
}

fn fail_with(result: &mut ScenarioResult, outcome: TestOutcome, error: String) {
    tracing::warn!(scenario = %result.name, error = %error, "Scenario could not run");
    result.outcome = outcome;
    result.error = Some(error);
}

/// Destroys an instance even when the owning future is dropped
struct TeardownGuard {
    manager: Arc<InstanceManager>,
    instance_id: Option<String>,
}

impl TeardownGuard {
    fn new(manager: Arc<InstanceManager>, instance_id: &str) -> Self {
        Self {
            manager,
            instance_id: Some(instance_id.to_string()),
        }
    }

    async fn teardown(mut self, budget: Duration) -> Option<super::result::InstanceLogs> {
        let id = self.instance_id.take()?;
        match tokio::time::timeout(budget, self.manager.destroy_instance(&id)).await {
            Ok(logs) => logs,
            Err(_) => {
                tracing::warn!(instance = %id, budget_secs = budget.as_secs(), "Teardown timed out");
                None
            }
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(id) = self.instance_id.take() {
            let manager = self.manager.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    manager.destroy_instance(&id).await;
                });
            }
        }
    }
}

/// Outcome of the step phase of one scenario
#[derive(Debug)]
pub struct ExecutedScenario {
    pub outcome: TestOutcome,
    pub steps: Vec<StepResult>,
    pub cleanup: Vec<StepResult>,
    pub error: Option<String>,
}

/// Run main steps until the first non-pass, then every cleanup step
///
/// Cleanup outcomes are recorded but do not change the scenario outcome.
/// Cleanup shares the scenario deadline, but is always granted at least one
/// default step timeout so it still runs after the main phase used up the
/// budget.
pub async fn execute_scenario(
    scenario: &TestScenario,
    client: &mut ToolClient,
    timeouts: &Timeouts,
    events: &Events,
    cancel: &CancellationToken,
) -> ExecutedScenario {
    let budget = scenario.timeout.unwrap_or_else(|| timeouts.scenario());
    let deadline = Instant::now() + budget;

    let mut outcome = TestOutcome::Passed;
    let mut error = None;
    let mut steps = Vec::new();
    for step in &scenario.steps {
        let result = execute_step(client, step, timeouts.step(), deadline, cancel).await;
        let _ = events.send(RunEvent::StepFinished {
            scenario: scenario.name.clone(),
            step: result.clone(),
        });
        let step_outcome = result.outcome;
        if step_outcome != TestOutcome::Passed {
            error = Some(format!(
                "step '{}': {}",
                result.step_id,
                result.error.as_deref().unwrap_or("failed")
            ));
        }
        steps.push(result);
        if step_outcome != TestOutcome::Passed {
            outcome = step_outcome;
            break;
        }
    }

    // Cleanup ignores cancellation of the main flow
    let cleanup_deadline = deadline.max(Instant::now() + timeouts.step());
    let cleanup_cancel = CancellationToken::new();
    let mut cleanup = Vec::new();
    for step in &scenario.cleanup {
        let result = execute_step(client, step, timeouts.step(), cleanup_deadline, &cleanup_cancel).await;
        if result.outcome != TestOutcome::Passed {
            tracing::warn!(
                scenario = %scenario.name,
                step = %result.step_id,
                error = ?result.error,
                "Cleanup step did not pass"
            );
        }
        cleanup.push(result);
    }

    ExecutedScenario {
        outcome,
        steps,
        cleanup,
        error,
    }
}

/// Run one step with retries, judging every attempt against its expectation
pub async fn execute_step(
    client: &mut ToolClient,
    step: &TestStep,
    default_timeout: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> StepResult {
    let started = Instant::now();
    let max_attempts = step.retry.as_ref().map(|r| r.count).unwrap_or(0).saturating_add(1);
    let args = serde_json::Value::Object(step.args.clone());

    let mut attempts = 0;
    let mut resolved_tool = None;
    let mut response: Option<CallToolResult> = None;
    let mut error: Option<String>;
    let mut transport_failed;

    loop {
        attempts += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            error = Some("scenario timeout exceeded".to_string());
            transport_failed = true;
            break;
        }
        let limit = step.timeout.unwrap_or(default_timeout).min(remaining);

        let call = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout(limit, client.call_tool_within(&step.tool, args.clone(), limit)) => {
                r.unwrap_or_else(|_| Err(Error::timeout(&step.tool, limit)))
            }
        };

        let transport_error = match call {
            Ok((resolved, result)) => {
                resolved_tool = Some(resolved);
                response = Some(result);
                None
            }
            Err(Error::Cancelled) => {
                error = Some(Error::Cancelled.to_string());
                transport_failed = true;
                break;
            }
            Err(e) => {
                response = None;
                Some(e.to_string())
            }
        };
        transport_failed = transport_error.is_some();

        match check_expectation(&step.expected, response.as_ref(), transport_error.as_deref()) {
            Ok(()) => {
                error = None;
                transport_failed = false;
                break;
            }
            Err(reason) => {
                tracing::debug!(step = %step.id, attempt = attempts, reason = %reason, "Expectation not met");
                error = Some(match &transport_error {
                    Some(t) if !reason.contains(t.as_str()) => format!("{} ({})", reason, t),
                    _ => reason,
                });
            }
        }

        if attempts >= max_attempts {
            break;
        }
        let delay = step
            .retry
            .as_ref()
            .map(|r| r.delay_after(attempts))
            .unwrap_or_default();
        if sleep_or_cancel(delay, cancel).await.is_err() {
            error = Some(Error::Cancelled.to_string());
            transport_failed = true;
            break;
        }
    }

    let outcome = match (&error, transport_failed) {
        (None, _) => TestOutcome::Passed,
        (Some(_), true) => TestOutcome::Error,
        (Some(_), false) => TestOutcome::Failed,
    };

    StepResult {
        step_id: step.id.clone(),
        tool: step.tool.clone(),
        resolved_tool,
        outcome,
        attempts,
        duration: started.elapsed(),
        response,
        error,
    }
}

/// Run `scenarios` through `run_one` with up to `parallel` workers
///
/// After fail-fast trips or `cancel` fires, scenarios not yet started are
/// reported as Skipped. Results are returned in input order.
pub async fn dispatch<F, Fut>(
    scenarios: Vec<Arc<TestScenario>>,
    parallel: usize,
    fail_fast: bool,
    cancel: CancellationToken,
    run_one: F,
) -> Vec<ScenarioResult>
where
    F: Fn(Arc<TestScenario>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    let total = scenarios.len();
    let stop = Arc::new(AtomicBool::new(false));

    if parallel <= 1 {
        let mut results = Vec::with_capacity(total);
        for scenario in scenarios {
            if let Some(reason) = skip_reason(&stop, &cancel) {
                results.push(skipped(&scenario, reason));
                continue;
            }
            let result = run_one(scenario).await;
            if fail_fast && result.outcome.is_failure() {
                stop.store(true, Ordering::SeqCst);
            }
            results.push(result);
        }
        return results;
    }

    let (queue_tx, queue_rx) = mpsc::channel(total.max(1));
    for item in scenarios.iter().cloned().enumerate() {
        // Capacity covers every item
        let _ = queue_tx.try_send(item);
    }
    drop(queue_tx);
    let queue = Arc::new(Mutex::new(queue_rx));

    let mut workers = JoinSet::new();
    for worker in 0..parallel.min(total) {
        let queue = queue.clone();
        let stop = stop.clone();
        let cancel = cancel.clone();
        let run_one = run_one.clone();
        workers.spawn(async move {
            let mut done = Vec::new();
            loop {
                let next = queue.lock().await.recv().await;
                let Some((index, scenario)) = next else {
                    break;
                };
                if let Some(reason) = skip_reason(&stop, &cancel) {
                    done.push((index, skipped(&scenario, reason)));
                    continue;
                }
                tracing::debug!(worker, scenario = %scenario.name, "Worker picked scenario");
                let result = run_one(scenario).await;
                if fail_fast && result.outcome.is_failure() {
                    stop.store(true, Ordering::SeqCst);
                }
                done.push((index, result));
            }
            done
        });
    }

    let mut slots: Vec<Option<ScenarioResult>> = vec![None; total];
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(done) => {
                for (index, result) in done {
                    slots[index] = Some(result);
                }
            }
            Err(e) => tracing::error!(error = %e, "Scenario worker failed"),
        }
    }

    slots
        .into_iter()
        .zip(scenarios)
        .map(|(slot, scenario)| {
            slot.unwrap_or_else(|| ScenarioResult {
                outcome: TestOutcome::Error,
                error: Some("scenario worker terminated unexpectedly".to_string()),
                ..ScenarioResult::new(&scenario.name, scenario.category, &scenario.concept)
            })
        })
        .collect()
}

fn skip_reason(stop: &AtomicBool, cancel: &CancellationToken) -> Option<&'static str> {
    if cancel.is_cancelled() {
        Some("run cancelled")
    } else if stop.load(Ordering::SeqCst) {
        Some("skipped after an earlier failure (fail-fast)")
    } else {
        None
    }
}

fn skipped(scenario: &TestScenario, reason: &str) -> ScenarioResult {
    ScenarioResult::skipped(&scenario.name, scenario.category, &scenario.concept, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::client::{MockReply, MockToolClient};
    use crate::common::Result;
    use crate::testing::config::Category;

    async fn run_steps_with(
        scenario: &TestScenario,
        client: &mut ToolClient,
        timeouts: &Timeouts,
    ) -> Result<ExecutedScenario> {
        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect().await?;
        let executed = execute_scenario(scenario, client, timeouts, &tx, &CancellationToken::new()).await;
        client.close().await;
        Ok(executed)
    }

    fn scenario(yaml: &str) -> TestScenario {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn mock(client: MockToolClient) -> ToolClient {
        ToolClient::Mock(client)
    }

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            step_secs: 2,
            scenario_secs: 10,
            teardown_secs: 5,
            ..Timeouts::default()
        }
    }

    #[tokio::test]
    async fn test_retry_attempts_exactly_count_plus_one() {
        let s = scenario(
            r#"
name: retries
category: behavioral
concept: workflow
steps:
  - id: poll
    tool: status
    retry: { count: 3, delay: 1ms }
    expected: { contains: [ready] }
"#,
        );
        let backend = MockToolClient::new(["svc_status"])
            .with_replies("svc_status", [MockReply::Result(CallToolResult::text("pending"))]);
        let log = backend.call_log();
        let mut client = mock(backend);

        let executed = run_steps_with(&s, &mut client, &fast_timeouts()).await.unwrap();
        assert_eq!(executed.outcome, TestOutcome::Failed);
        assert_eq!(executed.steps[0].attempts, 4);
        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(executed.steps[0].resolved_tool.as_deref(), Some("svc_status"));
    }

    #[tokio::test]
    async fn test_retry_stops_once_expectation_met() {
        let s = scenario(
            r#"
name: eventually
category: behavioral
concept: workflow
steps:
  - id: poll
    tool: status
    retry: { count: 5, delay: 1ms, backoff_multiplier: 2 }
    expected: { contains: [ready] }
"#,
        );
        let backend = MockToolClient::new(["status"]).with_replies(
            "status",
            [
                MockReply::Transport("connection reset".to_string()),
                MockReply::Result(CallToolResult::text("pending")),
                MockReply::Result(CallToolResult::text("ready")),
            ],
        );
        let mut client = mock(backend);

        let executed = run_steps_with(&s, &mut client, &fast_timeouts()).await.unwrap();
        assert_eq!(executed.outcome, TestOutcome::Passed);
        assert_eq!(executed.steps[0].attempts, 3);
        assert_eq!(executed.steps[0].retries(), 2);
        assert!(executed.steps[0].error.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_failure() {
        let s = scenario(
            r#"
name: cleanup-after-failure
category: integration
concept: service
steps:
  - id: create
    tool: create
  - id: check
    tool: check
    expected: { contains: [healthy] }
  - id: never
    tool: create
cleanup:
  - id: delete
    tool: delete
  - id: delete-again
    tool: delete
    expected: { success: false }
"#,
        );
        let backend = MockToolClient::new(["create", "check", "delete"])
            .with_replies("check", [MockReply::Result(CallToolResult::text("degraded"))]);
        let log = backend.call_log();
        let mut client = mock(backend);

        let executed = run_steps_with(&s, &mut client, &fast_timeouts()).await.unwrap();
        assert_eq!(executed.outcome, TestOutcome::Failed);
        assert_eq!(executed.steps.len(), 2);
        assert_eq!(executed.cleanup.len(), 2);
        assert_eq!(executed.cleanup[0].outcome, TestOutcome::Passed);
        assert_eq!(executed.cleanup[1].outcome, TestOutcome::Failed);
        assert!(executed.error.unwrap().contains("check"));

        let tools: Vec<String> = log.lock().unwrap().iter().map(|c| c.tool.clone()).collect();
        assert_eq!(tools, vec!["create", "check", "delete", "delete"]);
    }

    #[tokio::test]
    async fn test_expected_tool_error_passes() {
        let s = scenario(
            r#"
name: negative
category: behavioral
concept: service
steps:
  - id: delete-missing
    tool: delete
    args: { name: ghost }
    expected:
      success: false
      error_contains: [not found]
"#,
        );
        let backend = MockToolClient::new(["x_storage_delete"]).with_replies(
            "x_storage_delete",
            [MockReply::Result(CallToolResult::error("resource ghost Not Found"))],
        );
        let log = backend.call_log();
        let mut client = mock(backend);

        let executed = run_steps_with(&s, &mut client, &fast_timeouts()).await.unwrap();
        assert_eq!(executed.outcome, TestOutcome::Passed);
        assert!(executed.steps[0].response.as_ref().unwrap().is_error);
        assert_eq!(log.lock().unwrap()[0].args["name"], "ghost");
    }

    #[tokio::test]
    async fn test_transport_error_is_error_outcome() {
        let s = scenario(
            r#"
name: unknown-tool
category: behavioral
concept: service
steps:
  - id: call
    tool: missing
"#,
        );
        let mut client = mock(MockToolClient::new(["present"]));
        let executed = run_steps_with(&s, &mut client, &fast_timeouts()).await.unwrap();
        assert_eq!(executed.outcome, TestOutcome::Error);
        assert!(executed.steps[0].error.as_ref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_expired_scenario_deadline() {
        let s = scenario(
            r#"
name: no-time
category: behavioral
concept: service
steps:
  - id: call
    tool: ping
"#,
        );
        let mut client = mock(MockToolClient::new(["ping"]));
        client.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let step = &s.steps[0];
        let result = execute_step(&mut client, step, Duration::from_secs(1), Instant::now(), &cancel).await;
        assert_eq!(result.outcome, TestOutcome::Error);
        assert_eq!(result.error.as_deref(), Some("scenario timeout exceeded"));
    }

    #[tokio::test]
    async fn test_cancelled_step() {
        let s = scenario(
            r#"
name: cancelled
category: behavioral
concept: service
steps:
  - id: call
    tool: ping
    retry: { count: 10, delay: 10s }
    expected: { contains: [never] }
"#,
        );
        let mut client = mock(MockToolClient::new(["ping"]));
        client.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let deadline = Instant::now() + Duration::from_secs(60);
        let result = execute_step(&mut client, &s.steps[0], Duration::from_secs(1), deadline, &cancel).await;
        assert_eq!(result.outcome, TestOutcome::Error);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_step_timeout_overrides_shorter_default() {
        let s = scenario(
            r#"
name: slow-tool
category: behavioral
concept: service
steps:
  - id: patient
    tool: slow
    timeout: 5s
  - id: impatient
    tool: slow
"#,
        );
        let mut client = mock(MockToolClient::new(["slow"]).with_latency(Duration::from_millis(1500)));
        let timeouts = Timeouts {
            step_secs: 1,
            ..fast_timeouts()
        };

        let executed = run_steps_with(&s, &mut client, &timeouts).await.unwrap();
        assert_eq!(executed.steps[0].outcome, TestOutcome::Passed);
        assert_eq!(executed.steps[1].outcome, TestOutcome::Error);
        assert!(executed.steps[1].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cleanup_bounded_by_scenario_deadline_with_floor() {
        let s = scenario(
            r#"
name: tight-budget
category: behavioral
concept: service
timeout: 300ms
steps:
  - id: work
    tool: slow
cleanup:
  - id: first
    tool: slow
  - id: second
    tool: slow
"#,
        );
        let mut client = mock(MockToolClient::new(["slow"]).with_latency(Duration::from_millis(700)));
        let timeouts = Timeouts {
            step_secs: 1,
            teardown_secs: 30,
            ..fast_timeouts()
        };

        let started = Instant::now();
        let executed = run_steps_with(&s, &mut client, &timeouts).await.unwrap();
        let elapsed = started.elapsed();

        // Main step is cut at the scenario deadline
        assert_eq!(executed.outcome, TestOutcome::Error);
        // Cleanup still gets one default step timeout after the deadline passed
        assert_eq!(executed.cleanup[0].outcome, TestOutcome::Passed);
        assert_eq!(executed.cleanup[1].outcome, TestOutcome::Error);
        assert!(elapsed < Duration::from_millis(2000), "elapsed {:?}", elapsed);
    }

    fn named(name: &str) -> Arc<TestScenario> {
        Arc::new(scenario(&format!(
            "name: {}\ncategory: behavioral\nconcept: c\nsteps:\n  - id: s\n    tool: t\n",
            name
        )))
    }

    fn outcome_for(name: &str) -> TestOutcome {
        if name.starts_with("fail") {
            TestOutcome::Failed
        } else {
            TestOutcome::Passed
        }
    }

    async fn fake_run(scenario: Arc<TestScenario>) -> ScenarioResult {
        tokio::time::sleep(Duration::from_millis(5)).await;
        ScenarioResult {
            outcome: outcome_for(&scenario.name),
            ..ScenarioResult::new(&scenario.name, Category::Behavioral, "c")
        }
    }

    #[tokio::test]
    async fn test_dispatch_preserves_input_order() {
        let names = ["a", "b", "c", "d", "e", "f", "g"];
        let scenarios: Vec<_> = names.iter().map(|n| named(n)).collect();

        for parallel in [1, 3, 10] {
            let results = dispatch(scenarios.clone(), parallel, false, CancellationToken::new(), fake_run).await;
            let got: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
            assert_eq!(got, names, "parallel = {}", parallel);
            assert!(results.iter().all(|r| r.outcome == TestOutcome::Passed));
        }
    }

    #[tokio::test]
    async fn test_sequential_fail_fast_skips_rest() {
        let scenarios = vec![named("a"), named("fail-b"), named("c"), named("d")];
        let results = dispatch(scenarios, 1, true, CancellationToken::new(), fake_run).await;
        let outcomes: Vec<_> = results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![TestOutcome::Passed, TestOutcome::Failed, TestOutcome::Skipped, TestOutcome::Skipped]
        );
    }

    #[tokio::test]
    async fn test_parallel_fail_fast_drains_queue_as_skipped() {
        let mut scenarios = vec![named("fail-first")];
        for i in 0..20 {
            scenarios.push(named(&format!("s{}", i)));
        }
        let results = dispatch(scenarios, 2, true, CancellationToken::new(), fake_run).await;
        assert_eq!(results.len(), 21);
        assert_eq!(results[0].outcome, TestOutcome::Failed);
        assert!(results.iter().any(|r| r.outcome == TestOutcome::Skipped));
        assert_eq!(results.last().unwrap().outcome, TestOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = dispatch(vec![named("a"), named("b")], 2, false, cancel, fake_run).await;
        assert!(results.iter().all(|r| r.outcome == TestOutcome::Skipped));
        assert_eq!(results[0].error.as_deref(), Some("run cancelled"));
    }

    #[test]
    fn test_external_target_forces_sequential() {
        let runner = Runner::new(
            Target::External("http://localhost:1/mcp".to_string()),
            RunConfig {
                parallel: 8,
                ..RunConfig::default()
            },
        );
        assert_eq!(runner.effective_parallel(5), 1);
    }
}
