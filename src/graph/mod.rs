//! Graph description and routing tables.
//!
//! A graph arrives as configuration data (`start_graph` payload, predefined
//! graph in the app config, or a YAML file). It is validated once, compiled
//! into an immutable [`Graph`] with a per-message-name destination table,
//! and shared read-only for the engine's lifetime. It is never rebuilt per
//! message.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{PlexusError, Result};
use crate::msg::conversion::MsgConversion;
use crate::msg::{Destination, MsgKind};

pub const DEFAULT_EXTENSION_GROUP: &str = "default";

/// The nodes in the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    /// The unique name of the extension node.
    pub name: String,
    /// Addon the extension is instantiated from.
    pub addon: String,
    /// Thread the extension lives on; extensions sharing a group share one
    /// dedicated thread.
    #[serde(default = "default_group")]
    pub extension_group: String,
    /// Owning app; `None` means the local app.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app: Option<String>,
    /// Static property overrides handed to the addon factory.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub property: Option<Value>,
}

fn default_group() -> String {
    DEFAULT_EXTENSION_GROUP.to_string()
}

/// One destination of an edge, optionally with conversion rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extension_group: Option<String>,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msg_conversion: Option<MsgConversion>,
}

/// Routes for one message name out of one source extension. More than one
/// destination means fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDef {
    pub name: String,
    pub dest: Vec<EdgeDest>,
}

/// All edges leaving one source extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDef {
    pub extension: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<EdgeDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<EdgeDef>,
}

/// Declared topology: nodes plus routing edges, as found in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphDefinition {
    pub nodes: Vec<NodeDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionDef>,
}

impl GraphDefinition {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Structural validation before an engine is built. Cycles and diamonds
    /// are legal and deliberately not detected; termination is the extension
    /// logic's responsibility.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(PlexusError::validation("graph has no nodes"));
        }
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(PlexusError::validation_field(
                    format!("duplicate extension node {:?}", node.name),
                    node.name.clone(),
                ));
            }
            if node.addon.is_empty() {
                return Err(PlexusError::validation_field(
                    format!("node {:?} has an empty addon", node.name),
                    node.name.clone(),
                ));
            }
        }
        for conn in &self.connections {
            if !names.contains(conn.extension.as_str()) {
                return Err(PlexusError::validation_field(
                    format!("connection source {:?} is not a node", conn.extension),
                    conn.extension.clone(),
                ));
            }
            for edge in conn.cmd.iter().chain(conn.data.iter()) {
                if edge.dest.is_empty() {
                    return Err(PlexusError::validation_field(
                        format!("edge {:?} has no destinations", edge.name),
                        edge.name.clone(),
                    ));
                }
                for dest in &edge.dest {
                    // Remote destinations are resolved by the remote app.
                    if dest.app.is_none() && !names.contains(dest.extension.as_str()) {
                        return Err(PlexusError::validation_field(
                            format!(
                                "edge {:?} targets unknown extension {:?}",
                                edge.name, dest.extension
                            ),
                            dest.extension.clone(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    extension: String,
    kind: MsgKind,
    name: String,
}

/// One resolved routing target of an edge.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub dest: Destination,
    pub conversion: Option<MsgConversion>,
}

/// Immutable per-message-name destination table, built once per graph.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<RouteKey, Vec<RouteEntry>>,
}

impl RouteTable {
    fn build(def: &GraphDefinition) -> Self {
        let mut routes: HashMap<RouteKey, Vec<RouteEntry>> = HashMap::new();
        for conn in &def.connections {
            for (kind, edges) in [(MsgKind::Cmd, &conn.cmd), (MsgKind::Data, &conn.data)] {
                for edge in edges {
                    let key = RouteKey {
                        extension: conn.extension.clone(),
                        kind,
                        name: edge.name.clone(),
                    };
                    let entries = edge
                        .dest
                        .iter()
                        .map(|d| RouteEntry {
                            dest: Destination {
                                app_uri: d.app.clone(),
                                graph_id: None,
                                extension_group: d.extension_group.clone(),
                                extension: Some(d.extension.clone()),
                            },
                            conversion: d.msg_conversion.clone(),
                        })
                        .collect();
                    routes.insert(key, entries);
                }
            }
        }
        Self { routes }
    }

    pub fn lookup(&self, extension: &str, kind: MsgKind, name: &str) -> Option<&[RouteEntry]> {
        // Data-like kinds share the data routes.
        let kind = match kind {
            MsgKind::Cmd | MsgKind::Timer => MsgKind::Cmd,
            _ => MsgKind::Data,
        };
        self.routes
            .get(&RouteKey {
                extension: extension.to_string(),
                kind,
                name: name.to_string(),
            })
            .map(Vec::as_slice)
    }
}

/// A validated, compiled graph. Read-only after construction; the engine
/// shares it via `Arc`.
#[derive(Debug)]
pub struct Graph {
    pub id: String,
    pub definition: GraphDefinition,
    routes: RouteTable,
    /// group name -> node names, in declaration order.
    groups: BTreeMap<String, Vec<String>>,
}

impl Graph {
    pub fn build(id: impl Into<String>, definition: GraphDefinition) -> Result<Self> {
        definition.validate()?;
        let routes = RouteTable::build(&definition);
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &definition.nodes {
            if node.app.is_some() {
                continue; // remote nodes run in their own app
            }
            groups
                .entry(node.extension_group.clone())
                .or_default()
                .push(node.name.clone());
        }
        Ok(Self {
            id: id.into(),
            definition,
            routes,
            groups,
        })
    }

    pub fn routes(&self, extension: &str, kind: MsgKind, name: &str) -> Option<&[RouteEntry]> {
        self.routes.lookup(extension, kind, name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.definition.nodes.iter().find(|n| n.name == name)
    }

    pub fn group_of(&self, extension: &str) -> Option<&str> {
        self.node(extension).map(|n| n.extension_group.as_str())
    }

    /// Extension groups hosted by the local app, each becoming one thread.
    pub fn local_groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn two_node_def() -> GraphDefinition {
        serde_json::from_value(json!({
            "nodes": [
                {"name": "a", "addon": "echo"},
                {"name": "b", "addon": "echo", "extension_group": "workers"}
            ],
            "connections": [
                {"extension": "a", "cmd": [
                    {"name": "hello_world", "dest": [{"extension": "b"}]}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_route_table_lookup() {
        let graph = Graph::build("g1", two_node_def()).unwrap();
        let routes = graph.routes("a", MsgKind::Cmd, "hello_world").unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dest.extension.as_deref(), Some("b"));
        assert!(graph.routes("b", MsgKind::Cmd, "hello_world").is_none());
        assert!(graph.routes("a", MsgKind::Data, "hello_world").is_none());
    }

    #[test]
    fn test_groups_by_thread() {
        let graph = Graph::build("g1", two_node_def()).unwrap();
        let groups = graph.local_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["default"], vec!["a".to_string()]);
        assert_eq!(groups["workers"], vec!["b".to_string()]);
    }

    #[test]
    fn test_validate_rejects_unknown_dest() {
        let def: GraphDefinition = serde_json::from_value(json!({
            "nodes": [{"name": "a", "addon": "echo"}],
            "connections": [
                {"extension": "a", "cmd": [
                    {"name": "x", "dest": [{"extension": "ghost"}]}
                ]}
            ]
        }))
        .unwrap();
        let err = def.validate().unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_validate_rejects_duplicate_nodes() {
        let def: GraphDefinition = serde_json::from_value(json!({
            "nodes": [
                {"name": "a", "addon": "echo"},
                {"name": "a", "addon": "echo"}
            ]
        }))
        .unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_cycles_are_legal() {
        let def: GraphDefinition = serde_json::from_value(json!({
            "nodes": [
                {"name": "a", "addon": "echo"},
                {"name": "b", "addon": "echo"}
            ],
            "connections": [
                {"extension": "a", "cmd": [{"name": "ping", "dest": [{"extension": "b"}]}]},
                {"extension": "b", "cmd": [{"name": "ping", "dest": [{"extension": "a"}]}]}
            ]
        }))
        .unwrap();
        assert!(Graph::build("cyclic", def).is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let def = GraphDefinition::from_yaml(
            r#"
nodes:
  - name: a
    addon: echo
connections: []
"#,
        )
        .unwrap();
        assert_eq!(def.nodes[0].extension_group, DEFAULT_EXTENSION_GROUP);
    }
}
