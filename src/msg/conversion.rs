//! Per-edge message conversion.
//!
//! An edge may declare an ordered rule list that rewrites the outgoing
//! message into a fresh property bag; properties not named by any rule are
//! dropped. A symmetric optional rule list rewrites a result before it is
//! matched back into the sender's path table, adapting a downstream
//! extension's native result shape to what the upstream expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{PlexusError, Result};
use crate::msg::Message;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "conversion_mode", rename_all = "snake_case")]
pub enum ConversionRule {
    /// Sets `path` unconditionally, overwriting whatever an earlier rule
    /// put there. The reserved `msg.name` path renames the message.
    FixedValue { path: String, value: Value },
    /// Copies the value found at `original_path` in the pre-conversion
    /// message, as it was at send time.
    FromOriginal {
        path: String,
        original_path: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultRules {
    pub rules: Vec<ConversionRule>,
}

/// Declared per edge destination as
/// `msg_conversion { type: "per_property", rules, result }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsgConversion {
    #[serde(rename = "type")]
    pub conversion_type: ConversionType,
    pub rules: Vec<ConversionRule>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<ResultRules>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    PerProperty,
}

fn apply_rules(rules: &[ConversionRule], original: &Message) -> Result<Message> {
    // Fresh bag; only ruled paths survive.
    let mut out = original.duplicate();
    out.properties.clear();
    for rule in rules {
        match rule {
            ConversionRule::FixedValue { path, value } => {
                out.set_by_path(path, value.clone())?;
            }
            ConversionRule::FromOriginal {
                path,
                original_path,
            } => {
                let value = original.get_by_path(original_path).ok_or_else(|| {
                    PlexusError::validation_field(
                        format!("from_original source {original_path:?} is absent"),
                        original_path.clone(),
                    )
                })?;
                out.set_by_path(path, value)?;
            }
        }
    }
    Ok(out)
}

impl MsgConversion {
    /// Rewrites an outgoing message. Consumes nothing: the caller hands the
    /// pre-conversion message by reference and receives an independent
    /// converted copy to route.
    pub fn apply(&self, original: &Message) -> Result<Message> {
        apply_rules(&self.rules, original)
    }

    /// Rewrites a result on its way back, when result rules are declared.
    pub fn apply_result(&self, result: &Message) -> Result<Option<Message>> {
        match &self.result {
            Some(result_rules) => Ok(Some(apply_rules(&result_rules.rules, result)?)),
            None => Ok(None),
        }
    }
}
