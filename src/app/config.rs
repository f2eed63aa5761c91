//! App configuration, loaded from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{PlexusError, Result};
use crate::graph::GraphDefinition;

fn default_uri() -> String {
    "localhost".to_string()
}

/// Graph declared in the app config, startable by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedGraph {
    pub name: String,
    /// Start together with the app instead of on demand.
    #[serde(default)]
    pub auto_start: bool,
    /// At most one instance; reachable under the reserved graph ids.
    #[serde(default)]
    pub singleton: bool,
    pub graph: GraphDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub predefined_graphs: Vec<PredefinedGraph>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            uri: default_uri(),
            log_level: None,
            predefined_graphs: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(yaml: &str) -> Result<AppConfig> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<AppConfig> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PlexusError::validation(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&text)
    }

    pub fn predefined(&self, name: &str) -> Option<&PredefinedGraph> {
        self.predefined_graphs.iter().find(|g| g.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(PlexusError::validation_field("app uri is empty", "uri"));
        }
        if let Some(level) = &self.log_level {
            if level.parse::<tracing::Level>().is_err() {
                return Err(PlexusError::validation_field(
                    format!("unknown log_level {level:?}"),
                    "log_level",
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for predefined in &self.predefined_graphs {
            if !seen.insert(predefined.name.as_str()) {
                return Err(PlexusError::validation_field(
                    format!("duplicate predefined graph {:?}", predefined.name),
                    "predefined_graphs",
                ));
            }
            predefined.graph.validate()?;
        }
        let singletons = self
            .predefined_graphs
            .iter()
            .filter(|g| g.singleton)
            .count();
        if singletons > 1 {
            return Err(PlexusError::validation_field(
                "at most one predefined graph may be a singleton",
                "predefined_graphs",
            ));
        }
        Ok(())
    }
}
