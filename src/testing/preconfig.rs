//! Scenario pre-configuration and its on-disk materialization
//!
//! A scenario can declare tool providers, workflows and other definitions the
//! server must load at startup. They are written into a private config tree:
//!
//! ```text
//! <dir>/config.yaml
//! <dir>/mcpservers/<name>.yaml
//! <dir>/workflows/<name>.yaml
//! <dir>/capabilities/<name>.yaml
//! <dir>/serviceclasses/<name>.yaml
//! <dir>/services/<name>.yaml
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

use crate::common::{Error, Result};

/// Subdirectory for tool provider definitions
pub const MCP_SERVERS_DIR: &str = "mcpservers";
/// Subdirectory for workflow definitions
pub const WORKFLOWS_DIR: &str = "workflows";
/// Subdirectory for capability definitions
pub const CAPABILITIES_DIR: &str = "capabilities";
/// Subdirectory for service class definitions
pub const SERVICE_CLASSES_DIR: &str = "serviceclasses";
/// Subdirectory for service instance definitions
pub const SERVICES_DIR: &str = "services";
/// Main settings file
pub const MAIN_CONFIG_FILE: &str = "config.yaml";

/// Prefix the aggregator gives workflow tools
pub const WORKFLOW_TOOL_PREFIX: &str = "workflow_";

/// Declarative set of definitions to load before the instance starts
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PreConfiguration {
    #[serde(default)]
    pub mcp_servers: Vec<NamedDefinition>,
    #[serde(default)]
    pub workflows: Vec<NamedDefinition>,
    #[serde(default)]
    pub capabilities: Vec<NamedDefinition>,
    #[serde(default)]
    pub service_classes: Vec<NamedDefinition>,
    #[serde(default)]
    pub services: Vec<NamedDefinition>,
    /// Extra keys merged into the main settings file
    #[serde(default)]
    pub main_config: Option<Map<String, Value>>,
}

/// One named definition; `config` is passed through verbatim
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct NamedDefinition {
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl NamedDefinition {
    /// Document written to disk: the config with `name` set
    fn document(&self) -> Value {
        let mut doc = self.config.clone();
        doc.insert("name".to_string(), Value::String(self.name.clone()));
        Value::Object(doc)
    }

    /// Tool names declared under `config.tools[].name`
    fn declared_tools(&self) -> impl Iterator<Item = &str> {
        self.config
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|tool| tool.get("name").and_then(Value::as_str))
    }
}

impl PreConfiguration {
    /// Tool names the instance should advertise once it is ready
    ///
    /// Names are logical: the aggregator may prefix them, which the
    /// readiness check tolerates through alias matching.
    pub fn expected_tools(&self) -> Vec<String> {
        let mut tools = BTreeSet::new();
        for server in &self.mcp_servers {
            for tool in server.declared_tools() {
                tools.insert(tool.to_string());
            }
        }
        for workflow in &self.workflows {
            tools.insert(format!("{}{}", WORKFLOW_TOOL_PREFIX, workflow.name));
        }
        tools.into_iter().collect()
    }

    /// Write every definition into `dir`, one subdirectory per kind
    pub fn materialize(&self, dir: &Path) -> Result<()> {
        let kinds: [(&str, &[NamedDefinition]); 5] = [
            (MCP_SERVERS_DIR, &self.mcp_servers),
            (WORKFLOWS_DIR, &self.workflows),
            (CAPABILITIES_DIR, &self.capabilities),
            (SERVICE_CLASSES_DIR, &self.service_classes),
            (SERVICES_DIR, &self.services),
        ];

        for (subdir, definitions) in kinds {
            let kind_dir = dir.join(subdir);
            std::fs::create_dir_all(&kind_dir)?;
            for definition in definitions {
                let file_name = definition_file_name(&definition.name)?;
                let content = serde_yaml::to_string(&definition.document())?;
                std::fs::write(kind_dir.join(file_name), content)?;
            }
        }
        Ok(())
    }
}

/// Write the main settings file pointing the aggregator at `host:port`
pub fn write_main_config(
    dir: &Path,
    host: &str,
    port: u16,
    preconfig: Option<&PreConfiguration>,
) -> Result<()> {
    let mut root = preconfig
        .and_then(|p| p.main_config.clone())
        .unwrap_or_default();

    let mut aggregator = match root.remove("aggregator") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    aggregator.insert("host".to_string(), json!(host));
    aggregator.insert("port".to_string(), json!(port));
    aggregator
        .entry("transport".to_string())
        .or_insert_with(|| json!("streamable-http"));
    aggregator.insert("enabled".to_string(), json!(true));
    root.insert("aggregator".to_string(), Value::Object(aggregator));

    let content = serde_yaml::to_string(&Value::Object(root))?;
    std::fs::write(dir.join(MAIN_CONFIG_FILE), content)?;
    Ok(())
}

/// Reject names that would escape the kind directory
fn definition_file_name(name: &str) -> Result<String> {
    if name.is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
    {
        return Err(Error::Config(format!(
            "Invalid definition name '{}' in pre_configuration",
            name
        )));
    }
    Ok(format!("{}.yaml", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PreConfiguration {
        serde_yaml::from_str(
            r#"
mcp_servers:
  - name: storage
    config:
      type: mock
      tools:
        - name: create_resource
          response: { status: created }
        - name: delete_resource
workflows:
  - name: deploy
    config:
      steps: []
service_classes:
  - name: web
main_config:
  aggregator:
    transport: sse
    port: 1
  logging: { level: debug }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_expected_tools() {
        assert_eq!(
            sample().expected_tools(),
            vec!["create_resource", "delete_resource", "workflow_deploy"]
        );
        assert!(PreConfiguration::default().expected_tools().is_empty());
    }

    #[test]
    fn test_materialize_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let preconfig = sample();
        preconfig.materialize(tmp.path()).unwrap();
        write_main_config(tmp.path(), "localhost", 18042, Some(&preconfig)).unwrap();

        for sub in [
            MCP_SERVERS_DIR,
            WORKFLOWS_DIR,
            CAPABILITIES_DIR,
            SERVICE_CLASSES_DIR,
            SERVICES_DIR,
        ] {
            assert!(tmp.path().join(sub).is_dir(), "missing {}", sub);
        }

        let server: Value = serde_yaml::from_str(
            &std::fs::read_to_string(tmp.path().join("mcpservers/storage.yaml")).unwrap(),
        )
        .unwrap();
        assert_eq!(server["name"], "storage");
        assert_eq!(server["tools"][0]["name"], "create_resource");

        let main: Value = serde_yaml::from_str(
            &std::fs::read_to_string(tmp.path().join(MAIN_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        // Harness-owned fields win, user extras survive
        assert_eq!(main["aggregator"]["port"], 18042);
        assert_eq!(main["aggregator"]["transport"], "sse");
        assert_eq!(main["aggregator"]["enabled"], true);
        assert_eq!(main["logging"]["level"], "debug");
    }

    #[test]
    fn test_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let preconfig = PreConfiguration {
            services: vec![NamedDefinition {
                name: "../escape".to_string(),
                config: Map::new(),
            }],
            ..Default::default()
        };
        assert!(preconfig.materialize(tmp.path()).is_err());
    }
}
