//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::{self, config_path};
use super::{Error, Result};

/// Base port for instances spawned by the command-line harness
pub const DEFAULT_CLI_BASE_PORT: u16 = 18000;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct HarnessConfig {
    /// How to launch the server under test
    #[serde(default)]
    pub server: ServerConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Scenario, report and scratch locations
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Server-under-test launch settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Executable name or path of the aggregator
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Additional arguments appended after the standard serve arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Host written into the generated main config and used for probing
    #[serde(default = "default_host")]
    pub host: String,

    /// First port tried when allocating instance ports
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Path the protocol transport is served on
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: Vec::new(),
            host: default_host(),
            base_port: default_base_port(),
            endpoint_path: default_endpoint_path(),
        }
    }
}

fn default_binary() -> String {
    "aggregator".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_base_port() -> u16 {
    DEFAULT_CLI_BASE_PORT
}
fn default_endpoint_path() -> String {
    "/mcp".to_string()
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Overall readiness deadline for one instance
    #[serde(default = "default_readiness")]
    pub readiness_secs: u64,

    /// Sub-deadline for expected tools to be registered
    #[serde(default = "default_tool_registration")]
    pub tool_registration_secs: u64,

    /// Interval between TCP connectivity probes
    #[serde(default = "default_tcp_poll")]
    pub tcp_poll_ms: u64,

    /// Interval between list-tools probes
    #[serde(default = "default_tool_poll")]
    pub tool_poll_ms: u64,

    /// Fixed settle delay when a scenario declares no tools
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Step timeout when a step declares none
    #[serde(default = "default_step")]
    pub step_secs: u64,

    /// Scenario timeout when a scenario declares none
    #[serde(default = "default_scenario")]
    pub scenario_secs: u64,

    /// Grace period between SIGTERM and a forced kill
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Upper bound for the whole teardown of one instance
    #[serde(default = "default_teardown")]
    pub teardown_secs: u64,

    /// Overall suite timeout
    #[serde(default = "default_suite")]
    pub suite_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness_secs: default_readiness(),
            tool_registration_secs: default_tool_registration(),
            tcp_poll_ms: default_tcp_poll(),
            tool_poll_ms: default_tool_poll(),
            settle_ms: default_settle(),
            step_secs: default_step(),
            scenario_secs: default_scenario(),
            shutdown_grace_secs: default_shutdown_grace(),
            teardown_secs: default_teardown(),
            suite_secs: default_suite(),
        }
    }
}

fn default_readiness() -> u64 {
    60
}
fn default_tool_registration() -> u64 {
    45
}
fn default_tcp_poll() -> u64 {
    500
}
fn default_tool_poll() -> u64 {
    2000
}
fn default_settle() -> u64 {
    1000
}
fn default_step() -> u64 {
    30
}
fn default_scenario() -> u64 {
    300
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_teardown() -> u64 {
    30
}
fn default_suite() -> u64 {
    600
}

impl Timeouts {
    pub fn readiness(&self) -> Duration {
        Duration::from_secs(self.readiness_secs)
    }
    pub fn tool_registration(&self) -> Duration {
        Duration::from_secs(self.tool_registration_secs)
    }
    pub fn tcp_poll(&self) -> Duration {
        Duration::from_millis(self.tcp_poll_ms)
    }
    pub fn tool_poll(&self) -> Duration {
        Duration::from_millis(self.tool_poll_ms)
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }
    pub fn scenario(&self) -> Duration {
        Duration::from_secs(self.scenario_secs)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.teardown_secs)
    }
    pub fn suite(&self) -> Duration {
        Duration::from_secs(self.suite_secs)
    }
}

/// Filesystem locations
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PathsConfig {
    /// Default scenario file or directory
    pub scenarios: Option<PathBuf>,

    /// Directory for structured report files
    pub reports: Option<PathBuf>,

    /// Scratch directory for generated instance config trees
    pub work_dir: Option<PathBuf>,
}

impl PathsConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(paths::default_work_dir)
    }

    pub fn report_dir(&self) -> PathBuf {
        self.reports.clone().unwrap_or_else(paths::default_report_dir)
    }
}

impl HarnessConfig {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read '{}': {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Resolve the server binary to an executable path
    ///
    /// Bare names are searched in PATH; anything containing a path
    /// separator is used as given.
    pub fn resolve_server_binary(&self) -> Result<PathBuf> {
        let candidate = Path::new(&self.server.binary);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            if candidate.exists() {
                return Ok(candidate.to_path_buf());
            }
            return Err(Error::Config(format!(
                "Server binary '{}' does not exist",
                candidate.display()
            )));
        }
        which::which(&self.server.binary).map_err(|_| {
            Error::Config(format!(
                "Server binary '{}' not found in PATH. Set [server].binary or pass --server-binary",
                self.server.binary
            ))
        })
    }
}
