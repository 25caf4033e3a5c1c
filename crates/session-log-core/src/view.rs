use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{BlockKind, Entry, LogError, Record, RecordKind};

const TRUNCATION_SUFFIX: &str = "...[truncated]";
const DEFAULT_TAIL: usize = 10;
const DEFAULT_RADIUS: usize = 10;

/// A projected record: its index and extracted text.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LogLine {
    #[serde(rename = "line")]
    pub index: usize,
    pub content: String,
}

/// A tool result produced by a file read or edit.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRead {
    #[serde(rename = "line")]
    pub index: usize,
    pub file_path: String,
}

/// Anything addressable by a record index; windows select on it.
pub trait Indexed {
    fn index(&self) -> usize;
}

impl Indexed for LogLine {
    fn index(&self) -> usize {
        self.index
    }
}

impl Indexed for FileRead {
    fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ProjectionOptions {
    pub include_deleted: bool,
    /// Character limit per projected text; `None` or `Some(0)` is unlimited.
    pub max_field_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum WindowMode {
    #[default]
    All,
    Tail,
    Slice,
    Around,
}

/// Raw window parameters as they arrive from a caller.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct WindowParams {
    pub count: Option<usize>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub target: Option<usize>,
    pub radius: Option<usize>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Window {
    All,
    /// The last `n` items.
    Tail(usize),
    /// Items whose index lies in `[start, end]`; an open end runs to the last item.
    Slice { start: usize, end: Option<usize> },
    /// Items whose index lies in `[target - radius, target + radius]`.
    Around { target: usize, radius: usize },
}

impl Window {
    /// Validates `params` for `mode`.
    ///
    /// Lenient mode fills gaps the way the current-log views always have: a
    /// tail of 10, a slice from index 0. Strict mode requires every bound the
    /// mode names.
    ///
    /// # Errors
    /// Returns [`LogError::InvalidArgument`] when a required bound is missing.
    pub fn build(mode: WindowMode, params: &WindowParams, strict: bool) -> Result<Self, LogError> {
        match mode {
            WindowMode::All => Ok(Self::All),
            WindowMode::Tail => match params.count {
                Some(count) => Ok(Self::Tail(count)),
                None if strict => Err(missing("count is required for tail mode")),
                None => Ok(Self::Tail(DEFAULT_TAIL)),
            },
            WindowMode::Slice => {
                if strict && (params.start.is_none() || params.end.is_none()) {
                    return Err(missing("start and end are required for slice mode"));
                }
                Ok(Self::Slice {
                    start: params.start.unwrap_or(0),
                    end: params.end,
                })
            }
            WindowMode::Around => {
                let target = params
                    .target
                    .ok_or_else(|| missing("target is required for around mode"))?;
                Ok(Self::Around {
                    target,
                    radius: params.radius.unwrap_or(DEFAULT_RADIUS),
                })
            }
        }
    }

    fn contains(&self, index: usize) -> bool {
        match *self {
            Self::All | Self::Tail(_) => true,
            Self::Slice { start, end } => index >= start && end.map_or(true, |end| index <= end),
            Self::Around { target, radius } => {
                index >= target.saturating_sub(radius) && index <= target.saturating_add(radius)
            }
        }
    }
}

fn missing(message: &str) -> LogError {
    LogError::InvalidArgument(message.to_string())
}

/// Narrows an index-ordered sequence to the window.
#[must_use]
pub fn apply_window<T: Indexed>(items: Vec<T>, window: &Window) -> Vec<T> {
    match *window {
        Window::All => items,
        Window::Tail(n) => {
            let skip = items.len().saturating_sub(n);
            items.into_iter().skip(skip).collect()
        }
        Window::Slice { .. } | Window::Around { .. } => items
            .into_iter()
            .filter(|item| window.contains(item.index()))
            .collect(),
    }
}

/// Projects conversational records to their text.
///
/// Records holding any tool block are dropped, as are deleted records unless
/// `include_deleted` is set.
#[must_use]
pub fn project(entries: &[Entry], options: &ProjectionOptions) -> Vec<LogLine> {
    entries
        .iter()
        .filter(|entry| is_visible(entry, options.include_deleted))
        .map(|entry| LogLine {
            index: entry.index,
            content: truncate(extract_text(&entry.record), options.max_field_size),
        })
        .collect()
}

/// Case-insensitive keyword search over the same text [`project`] shows.
#[must_use]
pub fn search(entries: &[Entry], keyword: &str, options: &ProjectionOptions) -> Vec<LogLine> {
    let needle = keyword.to_lowercase();
    entries
        .iter()
        .filter(|entry| is_visible(entry, options.include_deleted))
        .filter_map(|entry| {
            let text = extract_text(&entry.record);
            text.to_lowercase().contains(&needle).then(|| LogLine {
                index: entry.index,
                content: truncate(text, options.max_field_size),
            })
        })
        .collect()
}

#[must_use]
pub fn count(entries: &[Entry], include_deleted: bool) -> usize {
    entries
        .iter()
        .filter(|entry| include_deleted || !entry.record.is_deleted())
        .count()
}

/// Lists user records carrying a tool outcome whose parent assistant record
/// invoked `Read` or `Edit` with a `file_path`.
#[must_use]
pub fn file_reads(entries: &[Entry], include_deleted: bool) -> Vec<FileRead> {
    let mut assistants: HashMap<&str, &Record> = HashMap::new();
    for entry in entries {
        if entry.record.kind() != RecordKind::Assistant {
            continue;
        }
        if let Some(uuid) = entry.record.uuid() {
            assistants.entry(uuid).or_insert(&entry.record);
        }
    }

    entries
        .iter()
        .filter(|entry| include_deleted || !entry.record.is_deleted())
        .filter(|entry| entry.record.kind() == RecordKind::User)
        .filter(|entry| entry.record.tool_use_result().is_some_and(is_truthy))
        .filter_map(|entry| {
            let parent = assistants.get(entry.record.parent_uuid()?)?;
            Some(FileRead {
                index: entry.index,
                file_path: file_tool_path(parent)?.to_string(),
            })
        })
        .collect()
}

fn is_visible(entry: &Entry, include_deleted: bool) -> bool {
    !entry.record.has_tool_blocks() && (include_deleted || !entry.record.is_deleted())
}

fn file_tool_path(record: &Record) -> Option<&str> {
    record.blocks()?.iter().find_map(|block| {
        if BlockKind::of(block) != BlockKind::ToolUse {
            return None;
        }
        let name = block.get("name").and_then(Value::as_str)?;
        if name != "Read" && name != "Edit" {
            return None;
        }
        block
            .get("input")
            .and_then(|input| input.get("file_path"))
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
    })
}

/// Text shown for a record: joined `text` blocks or string content, falling
/// back to a top-level `content` string, then `summary`.
fn extract_text(record: &Record) -> String {
    if let Some(content) = record.message_content().filter(|value| is_truthy(value)) {
        return match content {
            Value::String(text) => text.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter(|block| BlockKind::of(block) == BlockKind::Text)
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        };
    }

    ["content", "summary"]
        .iter()
        .filter_map(|key| record.get(key).and_then(Value::as_str))
        .find(|text| !text.is_empty())
        .map(str::to_string)
        .unwrap_or_default()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truncate(text: String, max_field_size: Option<usize>) -> String {
    let Some(limit) = max_field_size.filter(|limit| *limit > 0) else {
        return text;
    };
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_SUFFIX}", &text[..cut]),
        None => text,
    }
}
