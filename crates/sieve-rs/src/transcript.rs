//! Transcript records as supplied by the host.
//!
//! A transcript is an ordered list of [`TranscriptRecord`]s, each holding
//! text parts and tool invocations. Parsing is lenient at the part level: a
//! part whose shape does not match (unknown kind, missing tool name, wrong
//! field types) is kept verbatim as [`Part::Unknown`], so it is skipped by
//! every pass yet written back unchanged.

use crate::error::{Error, Result};
use crate::session::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::path::Path;

/// One entry in the running conversation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(default)]
    pub role: String,
    /// Host-supplied timestamp, kept as given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TranscriptRecord {
    pub fn new(role: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            role: role.into(),
            parts,
            ..Self::default()
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", vec![Part::text(text)])
    }

    pub fn tool(invocation: ToolInvocation) -> Self {
        Self::new("assistant", vec![Part::Tool(invocation)])
    }
}

/// A part of a transcript record.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(TextPart),
    Tool(ToolInvocation),
    /// Anything that did not parse as a known part.
    Unknown(Value),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart {
            text: text.into(),
            extra: Map::new(),
        })
    }

    pub fn as_tool(&self) -> Option<&ToolInvocation> {
        match self {
            Part::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

/// A tool call and its captured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Set once the output has been replaced by a summary. Never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, input: Value, status: ToolStatus) -> Self {
        Self {
            tool: tool.into(),
            input,
            status,
            output: None,
            compacted_at: None,
            extra: Map::new(),
        }
    }

    pub fn completed(tool: impl Into<String>, input: Value, output: impl Into<String>) -> Self {
        let mut invocation = Self::new(tool, input, ToolStatus::Completed);
        invocation.output = Some(output.into());
        invocation
    }

    /// The file this invocation operated on, if any.
    pub fn file_path(&self) -> Option<&str> {
        self.input_str(&["file_path", "filePath", "path"])
    }

    /// First non-empty string input among `keys`.
    pub fn input_str(&self, keys: &[&str]) -> Option<&str> {
        let obj = self.input.as_object()?;
        keys.iter()
            .filter_map(|key| obj.get(*key).and_then(Value::as_str))
            .find(|v| !v.is_empty())
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted_at.is_some()
    }
}

/// Read a transcript stored as a JSON array of records.
pub fn read_transcript(path: &Path) -> Result<Vec<TranscriptRecord>> {
    let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&json).map_err(|e| Error::json(path, e))
}

/// Write a transcript back in place, atomically.
pub fn write_transcript(path: &Path, records: &[TranscriptRecord]) -> Result<()> {
    write_json_atomic(path, &records)
}

const TYPE_KEY: &str = "type";

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value.get(TYPE_KEY).and_then(Value::as_str).unwrap_or_default();

        let parsed = match kind {
            "text" => serde_json::from_value::<TextPart>(value.clone()).ok().map(|mut part| {
                part.extra.remove(TYPE_KEY);
                Part::Text(part)
            }),
            "tool" => serde_json::from_value::<ToolInvocation>(value.clone()).ok().map(|mut tool| {
                tool.extra.remove(TYPE_KEY);
                Part::Tool(tool)
            }),
            _ => None,
        };
        Ok(parsed.unwrap_or(Part::Unknown(value)))
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (kind, value) = match self {
            Part::Text(part) => ("text", serde_json::to_value(part)),
            Part::Tool(tool) => ("tool", serde_json::to_value(tool)),
            Part::Unknown(value) => return value.serialize(serializer),
        };
        let mut value = value.map_err(S::Error::custom)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(TYPE_KEY.to_string(), Value::String(kind.to_string()));
        }
        value.serialize(serializer)
    }
}
