//! Boundary validation of externally supplied JSON.
//!
//! Schema checks happen only here, at declared API boundaries; the value
//! types themselves carry no validation logic.

use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::{json, Value};

use crate::core::errors::{PlexusError, Result};

fn wire_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema = json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["cmd", "cmd_result", "data", "timer", "timer_timeout"]
                },
                "name": {"type": "string", "minLength": 1},
                "seq_id": {"type": "string"},
                "dest": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "app": {"type": "string"},
                            "graph": {"type": "string"},
                            "extension_group": {"type": "string"},
                            "extension": {"type": "string"}
                        },
                        "additionalProperties": false
                    }
                },
                "properties": {"type": "object"},
                "status_code": {"type": "integer"}
            },
            "required": ["type", "name"],
            "additionalProperties": false
        });
        jsonschema::validator_for(&schema).expect("wire message schema must compile")
    })
}

fn start_graph_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema = json!({
            "type": "object",
            "properties": {
                "nodes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["extension"]},
                            "name": {"type": "string", "minLength": 1},
                            "addon": {"type": "string", "minLength": 1},
                            "extension_group": {"type": "string"},
                            "app": {"type": "string"},
                            "property": {"type": "object"}
                        },
                        "required": ["name", "addon"]
                    }
                },
                "connections": {"type": "array", "items": {"type": "object"}},
                "long_running_mode": {"type": "boolean"},
                "predefined_graph_name": {"type": "string"}
            },
            "required": ["nodes"]
        });
        jsonschema::validator_for(&schema).expect("start_graph schema must compile")
    })
}

/// Checks an inbound decoded message value against the wire-logical shape.
pub fn validate_wire(value: &Value) -> Result<()> {
    if let Err(error) = wire_validator().validate(value) {
        return Err(PlexusError::protocol(format!(
            "malformed message: {error}"
        )));
    }
    Ok(())
}

/// Checks a `start_graph` property bag before the lifecycle manager builds
/// a graph out of it.
pub fn validate_start_graph(value: &Value) -> Result<()> {
    if let Err(error) = start_graph_validator().validate(value) {
        return Err(PlexusError::protocol(format!(
            "malformed start_graph payload: {error}"
        )));
    }
    Ok(())
}
