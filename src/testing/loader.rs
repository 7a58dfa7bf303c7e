//! Scenario loading, validation and filtering
//!
//! Loading is fail-closed: one malformed file aborts the whole load so a
//! broken scenario can never silently drop out of a suite.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::{Error, Result};

use super::config::{Category, TestScenario, TestStep};

/// Predicates applied to loaded scenarios; all set fields must match
#[derive(Debug, Clone, Default)]
pub struct ScenarioFilter {
    pub category: Option<Category>,
    pub concept: Option<String>,
    pub scenario: Option<String>,
    /// Any-of tag match
    pub tags: Vec<String>,
}

impl ScenarioFilter {
    pub fn matches(&self, scenario: &TestScenario) -> bool {
        if let Some(category) = self.category {
            if scenario.category != category {
                return false;
            }
        }
        if let Some(concept) = self.concept.as_deref().filter(|c| !c.is_empty()) {
            if scenario.concept != concept {
                return false;
            }
        }
        if let Some(name) = self.scenario.as_deref().filter(|n| !n.is_empty()) {
            if scenario.name != name {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| scenario.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// A file may hold a single scenario or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioDocument {
    Many(Vec<TestScenario>),
    One(Box<TestScenario>),
}

/// Load every scenario under `path` (a file or a directory tree)
pub fn load_scenarios(path: &Path) -> Result<Vec<TestScenario>> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        collect_scenario_files(path, &mut files)?;
        files.sort();
        files
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(Error::ScenarioRead {
            path: path.to_path_buf(),
            error: "no such file or directory".to_string(),
        });
    };

    let mut scenarios = Vec::new();
    let mut seen = HashSet::new();
    for file in files {
        for scenario in load_file(&file)? {
            if !seen.insert(scenario.name.clone()) {
                return Err(Error::invalid_scenario(
                    &file,
                    format!("duplicate scenario name '{}'", scenario.name),
                ));
            }
            scenarios.push(scenario);
        }
    }

    tracing::debug!(count = scenarios.len(), path = %path.display(), "Loaded scenarios");
    Ok(scenarios)
}

/// Apply a filter, preserving load order
pub fn filter_scenarios(scenarios: &[TestScenario], filter: &ScenarioFilter) -> Vec<TestScenario> {
    scenarios
        .iter()
        .filter(|s| filter.matches(s))
        .cloned()
        .collect()
}

fn collect_scenario_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::ScenarioRead {
        path: dir.to_path_buf(),
        error: e.to_string(),
    })?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_scenario_files(&path, out)?;
        } else if is_scenario_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_scenario_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn load_file(path: &Path) -> Result<Vec<TestScenario>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::ScenarioRead {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let mut scenarios = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&content) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| Error::ScenarioParse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let parsed: ScenarioDocument =
            serde_yaml::from_value(value).map_err(|e| Error::ScenarioParse {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        match parsed {
            ScenarioDocument::Many(many) => scenarios.extend(many),
            ScenarioDocument::One(one) => scenarios.push(*one),
        }
    }

    for scenario in &scenarios {
        validate_scenario(scenario).map_err(|reason| Error::invalid_scenario(path, reason))?;
    }
    Ok(scenarios)
}

/// Check the fields serde cannot enforce
pub fn validate_scenario(scenario: &TestScenario) -> std::result::Result<(), String> {
    if scenario.name.trim().is_empty() {
        return Err("scenario name is required".to_string());
    }
    if scenario.concept.trim().is_empty() {
        return Err(format!("scenario '{}': concept is required", scenario.name));
    }
    if scenario.steps.is_empty() {
        return Err(format!("scenario '{}': at least one step is required", scenario.name));
    }

    for (kind, steps) in [("step", &scenario.steps), ("cleanup step", &scenario.cleanup)] {
        for (index, step) in steps.iter().enumerate() {
            validate_step(step).map_err(|reason| {
                format!("scenario '{}': {} #{}: {}", scenario.name, kind, index + 1, reason)
            })?;
        }
    }
    Ok(())
}

fn validate_step(step: &TestStep) -> std::result::Result<(), String> {
    if step.id.trim().is_empty() {
        return Err("id is required".to_string());
    }
    if step.tool.trim().is_empty() {
        return Err(format!("step '{}': tool is required", step.id));
    }
    if let Some(retry) = &step.retry {
        if let Some(multiplier) = retry.backoff_multiplier {
            if !multiplier.is_finite() || multiplier < 0.0 {
                return Err(format!(
                    "step '{}': backoff_multiplier must be >= 0, got {}",
                    step.id, multiplier
                ));
            }
        }
    }
    Ok(())
}
