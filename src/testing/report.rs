//! Result reporting
//!
//! Three output strategies share one event timeline: a narrative for
//! humans, a quiet summary for CI logs, and JSON for machines.

use chrono::Utc;
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::common::{truncate, Result};

use super::config::TestScenario;
use super::result::{ScenarioResult, StepResult, SuiteResult, TestOutcome};

/// Event sent from scenario workers to the reporter
#[derive(Debug, Clone)]
pub enum RunEvent {
    ScenarioStarted { name: String },
    StepFinished { scenario: String, step: StepResult },
    ScenarioFinished(Box<ScenarioResult>),
}

/// Run-level settings shown in the header
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub scenarios: usize,
    pub parallel: usize,
    pub fail_fast: bool,
    pub endpoint: Option<String>,
}

/// Output sink; stdout unless a test captures it
pub type Output = Box<dyn Write + Send>;

/// Reporting strategy
pub enum Reporter {
    /// Per-step narrative with failure details
    Verbose { out: Output, debug: bool },
    /// Failures and the final summary only
    Quiet { out: Output },
    /// One JSON document at the end, optionally saved as a report file
    Structured {
        out: Output,
        report_dir: Option<PathBuf>,
    },
}

impl Reporter {
    pub fn verbose(debug: bool) -> Self {
        Reporter::Verbose {
            out: Box::new(std::io::stdout()),
            debug,
        }
    }

    pub fn quiet() -> Self {
        Reporter::Quiet {
            out: Box::new(std::io::stdout()),
        }
    }

    pub fn structured(report_dir: Option<PathBuf>) -> Self {
        Reporter::Structured {
            out: Box::new(std::io::stdout()),
            report_dir,
        }
    }

    /// Dispatch one event to the matching callback
    pub fn handle(&mut self, event: RunEvent) {
        match event {
            RunEvent::ScenarioStarted { name } => self.on_scenario_start(&name),
            RunEvent::StepFinished { scenario, step } => self.on_step_result(&scenario, &step),
            RunEvent::ScenarioFinished(result) => self.on_scenario_result(&result),
        }
    }

    pub fn on_run_start(&mut self, scenarios: &[TestScenario], summary: &RunSummary) {
        match self {
            Reporter::Verbose { out, .. } => {
                let _ = writeln!(
                    out,
                    "\n{} {} scenario(s)",
                    "Running".blue().bold(),
                    scenarios.len().to_string().white().bold()
                );
                let mode = if summary.parallel > 1 {
                    format!("parallel ({} workers)", summary.parallel)
                } else {
                    "sequential".to_string()
                };
                let _ = writeln!(out, "  Mode: {}", mode.dimmed());
                if summary.fail_fast {
                    let _ = writeln!(out, "  {}", "Fail-fast enabled".dimmed());
                }
                if let Some(endpoint) = &summary.endpoint {
                    let _ = writeln!(out, "  Endpoint: {}", endpoint.dimmed());
                }
            }
            Reporter::Quiet { .. } | Reporter::Structured { .. } => {}
        }
    }

    pub fn on_scenario_start(&mut self, name: &str) {
        if let Reporter::Verbose { out, .. } = self {
            let _ = writeln!(out, "\n{} {}", "Scenario:".cyan(), name.white().bold());
        }
    }

    pub fn on_step_result(&mut self, scenario: &str, step: &StepResult) {
        let Reporter::Verbose { out, debug } = self else {
            return;
        };
        let retries = if step.retries() > 0 {
            format!(" ({} retries)", step.retries())
        } else {
            String::new()
        };
        let _ = writeln!(
            out,
            "  {} [{}] {} {}{}",
            symbol(step.outcome),
            scenario.dimmed(),
            step.step_id,
            format!("{}ms", step.duration.as_millis()).dimmed(),
            retries.dimmed()
        );
        if step.outcome != TestOutcome::Passed {
            if let Some(error) = &step.error {
                let _ = writeln!(out, "      {}", error.red());
            }
        }
        if *debug || step.outcome != TestOutcome::Passed {
            if let Some(response) = &step.response {
                let _ = writeln!(out, "      Response: {}", truncate(&response.rendered(), 500).dimmed());
            }
        }
    }

    pub fn on_scenario_result(&mut self, result: &ScenarioResult) {
        match self {
            Reporter::Verbose { out, debug } => {
                for step in &result.cleanup {
                    if step.outcome != TestOutcome::Passed {
                        let _ = writeln!(
                            out,
                            "  {} cleanup {}: {}",
                            "!".yellow(),
                            step.step_id,
                            step.error.as_deref().unwrap_or("failed")
                        );
                    }
                }
                let _ = writeln!(
                    out,
                    "{} {} {}",
                    symbol(result.outcome),
                    result.name.white().bold(),
                    format!("{} in {:.2}s", result.outcome, result.duration.as_secs_f64()).dimmed()
                );
                if let Some(error) = &result.error {
                    let _ = writeln!(out, "  {}", error.red());
                }
                if *debug || result.outcome.is_failure() {
                    write_logs(out, result);
                }
            }
            Reporter::Quiet { out } => {
                if result.outcome.is_failure() {
                    let _ = writeln!(out, "{} {}: {}", symbol(result.outcome), result.name, failure_reason(result));
                }
            }
            Reporter::Structured { .. } => {}
        }
    }

    /// Print the summary; the structured mode also writes the report file
    pub fn on_suite_result(&mut self, suite: &SuiteResult) -> Result<Option<PathBuf>> {
        match self {
            Reporter::Verbose { out, .. } | Reporter::Quiet { out } => {
                write_summary(out, suite);
                Ok(None)
            }
            Reporter::Structured { out, report_dir } => {
                let json = serde_json::to_string_pretty(suite)?;
                writeln!(out, "{}", json)?;
                match report_dir {
                    Some(dir) => write_report(dir, &json).map(Some),
                    None => Ok(None),
                }
            }
        }
    }
}

fn symbol(outcome: TestOutcome) -> colored::ColoredString {
    match outcome {
        TestOutcome::Passed => "✓".green(),
        TestOutcome::Failed => "✗".red(),
        TestOutcome::Error => "!".red().bold(),
        TestOutcome::Skipped => "-".yellow(),
    }
}

fn failure_reason(result: &ScenarioResult) -> String {
    result
        .error
        .clone()
        .or_else(|| {
            result
                .steps
                .iter()
                .find(|s| s.outcome.is_failure())
                .map(|s| format!("step '{}': {}", s.step_id, s.error.as_deref().unwrap_or("failed")))
        })
        .unwrap_or_else(|| result.outcome.to_string())
}

fn write_logs(out: &mut Output, result: &ScenarioResult) {
    let Some(logs) = result.instance_logs.as_ref().filter(|l| !l.is_empty()) else {
        return;
    };
    let tail = |text: &str| {
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(20)..].join("\n    ")
    };
    if !logs.stderr.is_empty() {
        let _ = writeln!(out, "  {}\n    {}", "Instance stderr:".dimmed(), tail(&logs.stderr));
    }
    if !logs.stdout.is_empty() {
        let _ = writeln!(out, "  {}\n    {}", "Instance stdout:".dimmed(), tail(&logs.stdout));
    }
}

fn write_summary(out: &mut Output, suite: &SuiteResult) {
    let _ = writeln!(out, "\n{}", "Summary".bold());
    let _ = writeln!(
        out,
        "  {} total, {} passed, {} failed, {} errors, {} skipped in {:.2}s",
        suite.total,
        suite.passed.to_string().green(),
        suite.failed.to_string().red(),
        suite.errors.to_string().red(),
        suite.skipped.to_string().yellow(),
        suite.duration.as_secs_f64()
    );
    for scenario in suite.scenarios.iter().filter(|s| s.outcome != TestOutcome::Passed) {
        let _ = writeln!(out, "  {} {} ({})", symbol(scenario.outcome), scenario.name, scenario.outcome);
    }
    if suite.all_passed() {
        let _ = writeln!(out, "\n{} {}", "✓".green().bold(), "All scenarios passed".green().bold());
    } else {
        let _ = writeln!(out, "\n{} {}", "✗".red().bold(), "Some scenarios did not pass".red().bold());
    }
}

fn write_report(dir: &Path, json: &str) -> Result<PathBuf> {
    let dir = crate::common::paths::ensure_dir(dir)?;
    let path = dir.join(format!("test-report-{}.json", Utc::now().format("%Y%m%d-%H%M%S")));
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), "Wrote test report");
    Ok(path)
}
