//! CLI command handling
//!
//! Loads configuration, builds the run target and reporter, and wires
//! Ctrl-C and the suite timeout into cancellation.

use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::commands::{Commands, OutputFormat, Selection};
use crate::common::config::{HarnessConfig, Timeouts};
use crate::common::Result;
use crate::testing::{
    filter_scenarios, load_scenarios, InstanceManager, InstanceSettings, Reporter, RunConfig,
    Runner, Target, TestScenario,
};

/// Dispatch a CLI command
///
/// Returns whether the command succeeded; for `test` that means every
/// selected scenario passed.
pub async fn dispatch(command: Commands, config_path: Option<&Path>) -> Result<bool> {
    let config = match config_path {
        Some(path) => HarnessConfig::load_from(path)?,
        None => HarnessConfig::load()?,
    };

    match command {
        Commands::Test {
            selection,
            endpoint,
            timeout,
            report_path,
            fail_fast,
            parallel,
            verbose,
            quiet,
            format,
            server_binary,
            base_port,
            keep_instances,
        } => {
            let mut config = config;
            if let Some(binary) = server_binary {
                config.server.binary = binary;
            }
            if let Some(port) = base_port {
                config.server.base_port = port;
            }

            let scenarios = load_selection(&selection, &config)?;
            let filter = selection.filter();
            if filter_scenarios(&scenarios, &filter).is_empty() {
                tracing::warn!("No scenarios matched the given filters");
            }

            let target = match endpoint {
                Some(endpoint) => {
                    if parallel > 1 {
                        tracing::warn!(parallel, "Endpoint override runs scenarios sequentially");
                    }
                    Target::External(endpoint)
                }
                None => {
                    let mut settings = InstanceSettings::from_config(&config)?;
                    settings.keep_instances = keep_instances;
                    crate::common::paths::ensure_dir(&settings.work_dir)?;
                    Target::Managed(Arc::new(InstanceManager::new(settings)))
                }
            };

            let mut reporter = match format {
                OutputFormat::Json => {
                    Reporter::structured(Some(report_path.unwrap_or_else(|| config.paths.report_dir())))
                }
                OutputFormat::Text if quiet => Reporter::quiet(),
                OutputFormat::Text => Reporter::verbose(verbose),
            };

            let runner = Runner::new(
                target,
                RunConfig {
                    filter,
                    parallel: usize::from(parallel),
                    fail_fast,
                    timeouts: config.timeouts.clone(),
                },
            );

            let cancel = CancellationToken::new();
            let watchdog = spawn_watchdog(cancel.clone(), suite_limit(timeout, &config.timeouts));
            let suite = runner.run(&scenarios, &mut reporter, cancel).await;
            watchdog.abort();

            Ok(suite.all_passed())
        }

        Commands::List { selection } => {
            let scenarios = load_selection(&selection, &config)?;
            let selected = filter_scenarios(&scenarios, &selection.filter());
            if selected.is_empty() {
                println!("No scenarios match");
                return Ok(true);
            }
            for scenario in &selected {
                print_scenario(scenario);
            }
            println!("\n{} scenario(s)", selected.len());
            Ok(true)
        }

        Commands::Validate { path } => {
            let path = path.unwrap_or_else(|| default_scenario_path(&config));
            let scenarios = load_scenarios(&path)?;
            println!(
                "{} {} scenario(s) valid in {}",
                "✓".green(),
                scenarios.len(),
                path.display()
            );
            Ok(true)
        }
    }
}

fn default_scenario_path(config: &HarnessConfig) -> PathBuf {
    config
        .paths
        .scenarios
        .clone()
        .unwrap_or_else(|| PathBuf::from("scenarios"))
}

fn load_selection(selection: &Selection, config: &HarnessConfig) -> Result<Vec<TestScenario>> {
    let path = selection
        .scenario_path
        .clone()
        .unwrap_or_else(|| default_scenario_path(config));
    load_scenarios(&path)
}

fn print_scenario(scenario: &TestScenario) {
    let tags = if scenario.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", scenario.tags.join(", "))
    };
    println!(
        "{} {} {}{}",
        scenario.name.white().bold(),
        format!("{}/{}", scenario.category, scenario.concept).cyan(),
        format!("{} step(s)", scenario.steps.len()).dimmed(),
        tags.dimmed()
    );
    if let Some(description) = &scenario.description {
        println!("  {}", description.dimmed());
    }
}

/// Whole-run limit: `--timeout` as given, else the configured suite timeout
fn suite_limit(timeout: Option<Duration>, timeouts: &Timeouts) -> Duration {
    timeout.unwrap_or_else(|| timeouts.suite())
}

/// Cancel the run on Ctrl-C or when the suite timeout elapses
fn spawn_watchdog(cancel: CancellationToken, limit: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::warn!("Interrupted, cancelling run and tearing down instances");
                    cancel.cancel();
                }
                Err(e) => tracing::debug!(error = %e, "Ctrl-C handler unavailable"),
            },
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(limit_ms = limit.as_millis() as u64, "Suite timeout reached, cancelling run");
                cancel.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_limit_keeps_sub_second_precision() {
        let timeouts = Timeouts::default();
        assert_eq!(
            suite_limit(Some(Duration::from_millis(1500)), &timeouts),
            Duration::from_millis(1500)
        );
        assert_eq!(
            suite_limit(Some(Duration::from_millis(250)), &timeouts),
            Duration::from_millis(250)
        );
        assert_eq!(suite_limit(None, &timeouts), timeouts.suite());
    }
}
