//! The message envelope and addressing types.
//!
//! A [`Message`] is move-only: it deliberately does not implement `Clone`.
//! Ownership transfers on every send, and fan-out happens through explicit
//! [`Message::duplicate`] calls that produce independent deep copies with
//! their own path ids. Nothing ever aliases a live property bag.

pub mod conversion;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::errors::{PlexusError, Result};

/// Correlation id tying an outbound command clone to its path table slot.
pub type PathId = Uuid;

/// Reserved property path that addresses the message name itself rather
/// than an entry of the property bag.
pub const MSG_NAME_PATH: &str = "msg.name";

/// Graph ids that denote the singleton predefined graph.
pub const RESERVED_GRAPH_IDS: [&str; 2] = ["default", "0"];

pub fn is_reserved_graph_id(id: &str) -> bool {
    RESERVED_GRAPH_IDS.contains(&id)
}

/// Built-in command names handled by the app and engine themselves.
pub const CMD_START_GRAPH: &str = "start_graph";
pub const CMD_STOP_GRAPH: &str = "stop_graph";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgKind {
    Cmd,
    CmdResult,
    Data,
    Timer,
    TimerTimeout,
}

/// Status carried by a `cmd_result`. On the wire this is an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum StatusCode {
    Ok,
    Error,
}

impl From<StatusCode> for i32 {
    fn from(s: StatusCode) -> i32 {
        match s {
            StatusCode::Ok => 0,
            StatusCode::Error => 1,
        }
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = String;

    fn try_from(v: i32) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Error),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

/// One routing target. Unspecified fields resolve against the sending
/// message's graph context at routing time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "app", skip_serializing_if = "Option::is_none", default)]
    pub app_uri: Option<String>,
    #[serde(rename = "graph", skip_serializing_if = "Option::is_none", default)]
    pub graph_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extension_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extension: Option<String>,
}

impl Destination {
    pub fn extension<S: Into<String>>(name: S) -> Self {
        Self {
            extension: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn in_graph<S: Into<String>>(mut self, graph_id: S) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn in_group<S: Into<String>>(mut self, group: S) -> Self {
        self.extension_group = Some(group.into());
        self
    }

    pub fn in_app<S: Into<String>>(mut self, app_uri: S) -> Self {
        self.app_uri = Some(app_uri.into());
        self
    }
}

/// Move-only message envelope.
#[derive(Debug)]
pub struct Message {
    pub kind: MsgKind,
    pub name: String,
    pub properties: Map<String, Value>,
    pub destinations: Vec<Destination>,
    /// Correlation id of the path this message belongs to. Set on outbound
    /// command clones and echoed back by their results.
    pub origin_path_id: Option<PathId>,
    /// Results only.
    pub status_code: Option<StatusCode>,
    /// Extension that produced the message, filled in by the runtime.
    pub source_extension: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(kind: MsgKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            properties: Map::new(),
            destinations: Vec::new(),
            origin_path_id: None,
            status_code: None,
            source_extension: None,
            timestamp: Utc::now(),
        }
    }

    pub fn cmd(name: impl Into<String>) -> Self {
        Self::new(MsgKind::Cmd, name)
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self::new(MsgKind::Data, name)
    }

    pub(crate) fn timer_timeout(name: impl Into<String>) -> Self {
        Self::new(MsgKind::TimerTimeout, name)
    }

    /// A result answering `cmd`: same name, same path id.
    pub fn result_for(cmd: &Message, status: StatusCode) -> Self {
        let mut msg = Self::new(MsgKind::CmdResult, cmd.name.clone());
        msg.status_code = Some(status);
        msg.origin_path_id = cmd.origin_path_id;
        msg
    }

    /// A result synthesized by the runtime itself (addressing failures,
    /// timeouts) for a given path.
    pub(crate) fn error_result(path_id: Option<PathId>, name: &str, detail: &str) -> Self {
        let mut msg = Self::new(MsgKind::CmdResult, name);
        msg.status_code = Some(StatusCode::Error);
        msg.origin_path_id = path_id;
        msg.set_detail(detail);
        msg
    }

    pub fn with_dest(mut self, dest: Destination) -> Self {
        self.destinations.push(dest);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Explicit deep copy. The runtime calls this once per fan-out
    /// destination and then stamps each copy with its own path id.
    pub fn duplicate(&self) -> Message {
        Message {
            kind: self.kind,
            name: self.name.clone(),
            properties: self.properties.clone(),
            destinations: self.destinations.clone(),
            origin_path_id: self.origin_path_id,
            status_code: self.status_code,
            source_extension: self.source_extension.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_cmd(&self) -> bool {
        matches!(self.kind, MsgKind::Cmd | MsgKind::Timer)
    }

    pub fn is_result(&self) -> bool {
        self.kind == MsgKind::CmdResult
    }

    /// Conventional `detail` property of a result.
    pub fn detail(&self) -> Option<&str> {
        self.properties.get("detail").and_then(Value::as_str)
    }

    pub fn set_detail(&mut self, detail: impl Into<String>) {
        self.properties
            .insert("detail".to_string(), Value::String(detail.into()));
    }

    /// Reads a dot-separated property path. The reserved `msg.name` path
    /// yields the message name.
    pub fn get_by_path(&self, path: &str) -> Option<Value> {
        if path == MSG_NAME_PATH {
            return Some(Value::String(self.name.clone()));
        }
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.properties.get(first)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current.clone())
    }

    /// Writes a dot-separated property path, creating intermediate objects.
    /// Setting the reserved `msg.name` path renames the message and requires
    /// a string value.
    pub fn set_by_path(&mut self, path: &str, value: Value) -> Result<()> {
        if path == MSG_NAME_PATH {
            match value {
                Value::String(name) => {
                    self.name = name;
                    return Ok(());
                }
                other => {
                    return Err(PlexusError::validation_field(
                        format!("msg.name must be a string, got {other}"),
                        MSG_NAME_PATH,
                    ))
                }
            }
        }
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(PlexusError::validation_field("empty property path", path));
        }
        if segments.len() == 1 {
            self.properties.insert(segments[0].to_string(), value);
            return Ok(());
        }
        let mut current = self
            .properties
            .entry(segments[0].to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for seg in &segments[1..segments.len() - 1] {
            current = as_object_coerced(current)
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        as_object_coerced(current).insert(segments[segments.len() - 1].to_string(), value);
        Ok(())
    }
}

/// Intermediate path segments overwrite non-object values with objects.
fn as_object_coerced(slot: &mut Value) -> &mut Map<String, Value> {
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("coerced to an object above"),
    }
}

/// Wire-logical shape of a message as produced by the external codec. The
/// codec itself (byte framing) lives outside this crate; embedders hand the
/// decoded JSON value to [`WireMessage::parse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq_id: Option<String>,
    #[serde(default)]
    pub dest: Vec<Destination>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_code: Option<StatusCode>,
}

impl WireMessage {
    /// Validates and decodes an inbound message value. Malformed input is a
    /// protocol error, never a panic.
    pub fn parse(value: &Value) -> Result<Message> {
        schema::validate_wire(value)?;
        let wire: WireMessage = serde_json::from_value(value.clone())?;
        let origin_path_id = match &wire.seq_id {
            Some(s) => Some(
                Uuid::parse_str(s)
                    .map_err(|e| PlexusError::protocol(format!("bad seq_id {s:?}: {e}")))?,
            ),
            None => None,
        };
        let mut msg = Message::new(wire.kind, wire.name);
        msg.properties = wire.properties;
        msg.destinations = wire.dest;
        msg.origin_path_id = origin_path_id;
        msg.status_code = wire.status_code;
        Ok(msg)
    }

    pub fn from_message(msg: &Message) -> WireMessage {
        WireMessage {
            kind: msg.kind,
            name: msg.name.clone(),
            seq_id: msg.origin_path_id.map(|id| id.to_string()),
            dest: msg.destinations.clone(),
            properties: msg.properties.clone(),
            status_code: msg.status_code,
        }
    }
}
