use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

pub mod codec;
pub mod insert;
pub mod mutate;
pub mod repair;
pub mod view;

pub use codec::{
    apply_plan, apply_updates, decode_best_effort, decode_strict, encode, Decoded, EditPlan,
    Entry, SkippedLine,
};
pub use insert::{plan_summary_insertion, Placement, SummaryContext, SummaryInsertion};
pub use mutate::{
    plan_redactions, plan_restorations, redact, replace, restore, DeleteTargets, RedactOptions,
};
pub use repair::{repair_all, repair_parent_links, repair_timestamps, RepairReport};
pub use view::{
    apply_window, count, file_reads, project, search, FileRead, Indexed, LogLine,
    ProjectionOptions, Window, WindowMode, WindowParams,
};

/// Reserved top-level key holding a record's mutation state.
pub const MUTATION_STATE_KEY: &str = "claude-context-service-mcp";

/// Text written in place of removed content.
pub const REMOVED_MARKER: &str =
    "<system-reminder>This content has been removed for context optimization.</system-reminder>";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LogError {
    #[error("no current session log found")]
    NoCurrentLog,
    #[error("invalid JSON at line {line}: {message}")]
    MalformedRecord { line: usize, message: String },
    #[error("line {0} not found")]
    RecordNotFound(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RecordKind {
    User,
    Assistant,
    Summary,
    /// Any discriminant this engine does not edit; keeps the raw value.
    Other(String),
}

impl RecordKind {
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("user") => Self::User,
            Some("assistant") => Self::Assistant,
            Some("summary") => Self::Summary,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Summary => "summary",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Other,
}

impl BlockKind {
    #[must_use]
    pub fn of(block: &Value) -> Self {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => Self::Text,
            Some("thinking") => Self::Thinking,
            Some("tool_use") => Self::ToolUse,
            Some("tool_result") => Self::ToolResult,
            _ => Self::Other,
        }
    }
}

/// One transcript record.
///
/// Backed by an insertion-ordered JSON object so that fields this engine never
/// touches are written back exactly as they were read.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value, returning `None` unless it is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Removes a field without disturbing the order of the remaining ones.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        RecordKind::parse(self.0.get("type").and_then(Value::as_str))
    }

    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.0.get("uuid").and_then(Value::as_str)
    }

    /// `None` for a chain root (`parentUuid` absent or `null`).
    #[must_use]
    pub fn parent_uuid(&self) -> Option<&str> {
        self.0.get("parentUuid").and_then(Value::as_str)
    }

    pub fn set_parent_uuid(&mut self, parent: &str) {
        self.set("parentUuid", Value::String(parent.to_string()));
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<&str> {
        self.0.get("timestamp").and_then(Value::as_str)
    }

    pub fn set_timestamp(&mut self, timestamp: String) {
        self.set("timestamp", Value::String(timestamp));
    }

    #[must_use]
    pub fn message_content(&self) -> Option<&Value> {
        self.0
            .get("message")
            .and_then(|message| message.get("content"))
            .filter(|content| !content.is_null())
    }

    pub(crate) fn message_content_mut(&mut self) -> Option<&mut Value> {
        self.0
            .get_mut("message")
            .and_then(Value::as_object_mut)
            .and_then(|message| message.get_mut("content"))
    }

    /// Content blocks when `message.content` is an array.
    #[must_use]
    pub fn blocks(&self) -> Option<&Vec<Value>> {
        self.message_content().and_then(Value::as_array)
    }

    #[must_use]
    pub fn has_block(&self, kind: BlockKind) -> bool {
        self.blocks()
            .is_some_and(|blocks| blocks.iter().any(|block| BlockKind::of(block) == kind))
    }

    /// True when the record carries a tool invocation or a tool result.
    #[must_use]
    pub fn has_tool_blocks(&self) -> bool {
        self.has_block(BlockKind::ToolUse) || self.has_block(BlockKind::ToolResult)
    }

    #[must_use]
    pub fn tool_use_result(&self) -> Option<&Value> {
        self.0.get("toolUseResult").filter(|value| !value.is_null())
    }

    #[must_use]
    pub fn mutation_state(&self) -> Option<MutationState> {
        self.0.get(MUTATION_STATE_KEY).map(MutationState::from_value)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.mutation_state().is_some_and(|state| state.deleted)
    }

    pub fn set_mutation_state(&mut self, state: MutationState) {
        self.set(MUTATION_STATE_KEY, state.into_value());
    }

    pub fn clear_mutation_state(&mut self) {
        let _ = self.remove(MUTATION_STATE_KEY);
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let line = serde_json::to_string(&self.0).map_err(|_| std::fmt::Error)?;
        f.write_str(&line)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Contents of the reserved mutation namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationState {
    pub deleted: bool,
    pub imported: bool,
    pub original: Option<Backup>,
    /// Keys written by other tools; carried through untouched.
    pub extra: Map<String, Value>,
}

impl MutationState {
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut state = Self::default();
        let Some(fields) = value.as_object() else {
            return state;
        };

        for (key, field) in fields {
            match key.as_str() {
                "deleted" => state.deleted = field.as_bool().unwrap_or(false),
                "imported" => state.imported = field.as_bool().unwrap_or(false),
                "original" => state.original = field.as_object().map(Backup::from_fields),
                _ => {
                    state.extra.insert(key.clone(), field.clone());
                }
            }
        }
        state
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut fields = self.extra;
        if self.imported {
            fields.insert("imported".to_string(), Value::Bool(true));
        }
        if let Some(original) = self.original {
            fields.insert("original".to_string(), original.into_value());
        }
        if self.deleted {
            fields.insert("deleted".to_string(), Value::Bool(true));
        }
        Value::Object(fields)
    }
}

/// Record fields saved before an overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backup {
    pub message_content: Option<Value>,
    pub tool_use_result: Option<Value>,
    pub summary: Option<Value>,
}

impl Backup {
    fn from_fields(fields: &Map<String, Value>) -> Self {
        Self {
            message_content: fields
                .get("message")
                .and_then(|message| message.get("content"))
                .cloned(),
            tool_use_result: fields.get("toolUseResult").cloned(),
            summary: fields.get("summary").cloned(),
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut fields = Map::new();
        if let Some(content) = self.message_content {
            let mut message = Map::new();
            message.insert("content".to_string(), content);
            fields.insert("message".to_string(), Value::Object(message));
        }
        if let Some(result) = self.tool_use_result {
            fields.insert("toolUseResult".to_string(), result);
        }
        if let Some(summary) = self.summary {
            fields.insert("summary".to_string(), summary);
        }
        Value::Object(fields)
    }
}

/// Parses an RFC 3339 timestamp into Unix milliseconds.
#[must_use]
pub fn parse_timestamp_millis(value: &str) -> Option<i128> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|parsed| parsed.unix_timestamp_nanos() / 1_000_000)
}

/// Formats Unix milliseconds as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn format_timestamp_millis(millis: i128) -> Option<String> {
    let parsed = OffsetDateTime::from_unix_timestamp_nanos(millis.checked_mul(1_000_000)?).ok()?;
    Some(format_timestamp(parsed))
}

#[must_use]
pub fn format_timestamp(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
