//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::testing::{Category, ScenarioFilter};

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios, each against its own server instance
    Test {
        #[command(flatten)]
        selection: Selection,

        /// Use an already running server instead of spawning instances
        /// (forces sequential execution, ignores pre_configuration)
        #[arg(long)]
        endpoint: Option<String>,

        /// Overall suite timeout, e.g. "10m" or "90s"
        #[arg(long, value_parser = parse_duration_arg)]
        timeout: Option<Duration>,

        /// Directory for structured report files
        #[arg(long)]
        report_path: Option<PathBuf>,

        /// Stop scheduling new scenarios after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Number of scenarios run concurrently
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=10))]
        parallel: u8,

        /// Show every response, not only failing ones
        #[arg(long, short, conflicts_with = "quiet")]
        verbose: bool,

        /// Only print failures and the summary
        #[arg(long, short)]
        quiet: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Server binary to launch (name in PATH or a path)
        #[arg(long)]
        server_binary: Option<String>,

        /// First port tried for instance allocation
        #[arg(long)]
        base_port: Option<u16>,

        /// Keep instance config directories after teardown
        #[arg(long)]
        keep_instances: bool,
    },

    /// List scenarios matching the filters
    List {
        #[command(flatten)]
        selection: Selection,
    },

    /// Parse and validate scenario files without running them
    Validate {
        /// Scenario file or directory
        path: Option<PathBuf>,
    },
}

/// Where scenarios come from and which of them to keep
#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// Scenario file or directory (default: [paths].scenarios or ./scenarios)
    #[arg(long)]
    pub scenario_path: Option<PathBuf>,

    /// Only scenarios of this category (behavioral, integration)
    #[arg(long)]
    pub category: Option<Category>,

    /// Only scenarios testing this concept
    #[arg(long)]
    pub concept: Option<String>,

    /// Only the scenario with this name
    #[arg(long)]
    pub scenario: Option<String>,

    /// Only scenarios carrying any of these tags (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

impl Selection {
    pub fn filter(&self) -> ScenarioFilter {
        ScenarioFilter {
            category: self.category,
            concept: self.concept.clone(),
            scenario: self.scenario.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    crate::common::parse_duration(s)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| format!("invalid duration '{}' (use e.g. 500ms, 30s, 10m)", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_parse_test_command() {
        let cli = TestCli::try_parse_from([
            "toolharness",
            "test",
            "--category",
            "behavioral",
            "--tag",
            "smoke",
            "--tag",
            "slow",
            "--parallel",
            "4",
            "--timeout",
            "5m",
            "--format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Test {
                selection,
                parallel,
                timeout,
                format,
                ..
            } => {
                assert_eq!(selection.category, Some(Category::Behavioral));
                assert_eq!(selection.tags, vec!["smoke", "slow"]);
                assert_eq!(parallel, 4);
                assert_eq!(timeout, Some(Duration::from_secs(300)));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected test command"),
        }
    }

    #[test]
    fn test_rejects_out_of_range_parallel() {
        assert!(TestCli::try_parse_from(["toolharness", "test", "--parallel", "0"]).is_err());
        assert!(TestCli::try_parse_from(["toolharness", "test", "--parallel", "11"]).is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(TestCli::try_parse_from(["toolharness", "test", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_category() {
        assert!(TestCli::try_parse_from(["toolharness", "list", "--category", "unit"]).is_err());
    }
}
