//! Error types for the test harness
//!
//! Error messages are meant to be actionable when read from a CI log:
//! they name the file, instance, or tool involved and what was expected.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Scenario Load Errors ===
    #[error("Failed to read scenario file '{path}': {error}")]
    ScenarioRead { path: PathBuf, error: String },

    #[error("Failed to parse scenario file '{path}': {error}")]
    ScenarioParse { path: PathBuf, error: String },

    #[error("Invalid scenario in '{path}': {reason}")]
    ScenarioInvalid { path: PathBuf, reason: String },

    // === Instance Errors ===
    #[error("No free port found after scanning {scanned} candidates from {base}")]
    PortExhausted { base: u16, scanned: u16 },

    #[error("Failed to spawn server instance '{instance}': {reason}")]
    InstanceSpawn { instance: String, reason: String },

    #[error("Server instance '{instance}' exited before becoming ready (status: {status})")]
    InstanceExited { instance: String, status: String },

    #[error(
        "Instance '{instance}' not ready after {waited_secs}s: expected tools {expected:?}, \
         available {available:?}, missing {missing:?}"
    )]
    ReadinessTimeout {
        instance: String,
        waited_secs: u64,
        expected: Vec<String>,
        available: Vec<String>,
        missing: Vec<String>,
    },

    #[error("Instance '{instance}' port {port} did not accept connections within {waited_secs}s")]
    PortTimeout {
        instance: String,
        port: u16,
        waited_secs: u64,
    },

    // === Protocol Errors ===
    #[error("Protocol handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("Tool '{name}' not found. Available: {available:?}")]
    ToolNotFound { name: String, available: Vec<String> },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request '{method}' failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Client is not connected. Call connect() first")]
    NotConnected,

    // === Timeout / Cancellation ===
    #[error("Operation '{operation}' timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Transport Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a scenario validation error for a file
    pub fn invalid_scenario(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ScenarioInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a spawn failure error
    pub fn spawn_failed(instance: &str, reason: impl ToString) -> Self {
        Self::InstanceSpawn {
            instance: instance.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: &str, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            millis: duration.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_timeout_message_lists_tool_diff() {
        let err = Error::ReadinessTimeout {
            instance: "basic-1".to_string(),
            waited_secs: 45,
            expected: vec!["ping".to_string(), "pong".to_string()],
            available: vec!["x_svc_ping".to_string()],
            missing: vec!["pong".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("basic-1"));
        assert!(msg.contains("missing [\"pong\"]"));
    }

    #[test]
    fn test_timeout_helper() {
        let err = Error::timeout("tools/call", std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Operation 'tools/call' timed out after 1500ms");
    }
}
