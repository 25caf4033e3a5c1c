use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::{Backup, BlockKind, Entry, LogError, Record, RecordKind, REMOVED_MARKER};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct RedactOptions {
    pub skip_imported: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Intent {
    Redact,
    Replace,
}

/// Overwrites a record's content with [`REMOVED_MARKER`] and marks it deleted.
///
/// Returns `None` when the record is left unchanged.
#[must_use]
pub fn redact(record: &Record, options: RedactOptions) -> Option<Record> {
    if let Some(state) = record.mutation_state() {
        if state.deleted || (options.skip_imported && state.imported) {
            return None;
        }
    }
    overwrite(record, REMOVED_MARKER, Intent::Redact)
}

/// Rewrites a record's content to `new_text`.
///
/// Refuses records whose only editable block is a tool invocation: rewriting
/// one would break the invocation/result pairing. Use [`redact`] instead.
#[must_use]
pub fn replace(record: &Record, new_text: &str) -> Option<Record> {
    overwrite(record, new_text, Intent::Replace)
}

/// Puts backed-up fields back and drops the mutation namespace.
#[must_use]
pub fn restore(record: &Record) -> Option<Record> {
    let backup = record.mutation_state()?.original?;
    let mut restored = record.clone();

    match record.kind() {
        RecordKind::User => {
            if let Some(content) = backup.message_content {
                put_message_content(&mut restored, content);
            }
            if let Some(result) = backup.tool_use_result {
                restored.set("toolUseResult", result);
            }
        }
        RecordKind::Assistant => {
            if let Some(content) = backup.message_content {
                put_message_content(&mut restored, content);
            }
        }
        RecordKind::Summary => {
            if let Some(summary) = backup.summary {
                restored.set("summary", summary);
            }
        }
        RecordKind::Other(_) => {}
    }

    restored.clear_mutation_state();
    Some(restored)
}

/// Which indices a delete request targets.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeleteTargets {
    pub lines: Option<Vec<usize>>,
    pub from_line: Option<usize>,
}

impl DeleteTargets {
    /// Expands the request against a log of `len` records, deduplicated and
    /// in request order.
    ///
    /// # Errors
    /// Returns [`LogError::InvalidArgument`] when neither `lines` nor
    /// `from_line` is given.
    pub fn resolve(&self, len: usize) -> Result<Vec<usize>, LogError> {
        if self.lines.is_none() && self.from_line.is_none() {
            return Err(LogError::InvalidArgument(
                "either lines or from_line must be specified".to_string(),
            ));
        }

        let explicit = self.lines.iter().flatten().copied();
        let tail = self.from_line.map_or(0..0, |from| from..len.max(from));

        let mut seen = BTreeSet::new();
        Ok(explicit
            .chain(tail)
            .filter(|index| seen.insert(*index))
            .collect())
    }
}

/// Builds the sparse update map for a delete request.
///
/// Indices with no record, already deleted records and (optionally) imported
/// records are skipped; the map's length is the number actually deleted.
///
/// # Errors
/// Returns [`LogError::InvalidArgument`] for an empty target request.
pub fn plan_redactions(
    entries: &[Entry],
    targets: &DeleteTargets,
    options: RedactOptions,
) -> Result<BTreeMap<usize, Record>, LogError> {
    let mut updates = BTreeMap::new();
    for index in targets.resolve(entries.len())? {
        let Some(entry) = find_entry(entries, index) else {
            continue;
        };
        if let Some(updated) = redact(&entry.record, options) {
            updates.insert(index, updated);
        }
    }
    Ok(updates)
}

/// Builds the sparse update map for a restore request.
#[must_use]
pub fn plan_restorations(entries: &[Entry], lines: &[usize]) -> BTreeMap<usize, Record> {
    lines
        .iter()
        .filter_map(|index| find_entry(entries, *index))
        .filter_map(|entry| restore(&entry.record).map(|restored| (entry.index, restored)))
        .collect()
}

/// Looks an entry up by its index.
#[must_use]
pub fn find_entry(entries: &[Entry], index: usize) -> Option<&Entry> {
    entries
        .binary_search_by_key(&index, |entry| entry.index)
        .ok()
        .map(|position| &entries[position])
}

fn overwrite(record: &Record, text: &str, intent: Intent) -> Option<Record> {
    let kind = record.kind();
    let backup = capture_backup(record, &kind)?;
    let mut updated = record.clone();

    match kind {
        RecordKind::User => overwrite_user(&mut updated, text),
        RecordKind::Assistant => overwrite_assistant(&mut updated, text, intent)?,
        RecordKind::Summary => updated.set("summary", Value::String(text.to_string())),
        RecordKind::Other(_) => return None,
    }

    let mut state = record.mutation_state().unwrap_or_default();
    if state.original.is_none() {
        state.original = Some(backup);
    }
    if intent == Intent::Redact {
        state.deleted = true;
    }
    updated.set_mutation_state(state);
    Some(updated)
}

/// Copies the fields an overwrite is about to destroy; `None` when the record
/// has nothing to overwrite.
fn capture_backup(record: &Record, kind: &RecordKind) -> Option<Backup> {
    match kind {
        RecordKind::User => Some(Backup {
            message_content: Some(record.message_content()?.clone()),
            tool_use_result: record.tool_use_result().cloned(),
            summary: None,
        }),
        RecordKind::Assistant => Some(Backup {
            message_content: Some(record.message_content()?.clone()),
            ..Backup::default()
        }),
        RecordKind::Summary => Some(Backup {
            summary: Some(record.get("summary")?.clone()),
            ..Backup::default()
        }),
        RecordKind::Other(_) => None,
    }
}

fn overwrite_user(record: &mut Record, text: &str) {
    let Some(content) = record.message_content_mut() else {
        return;
    };

    if let Value::Array(blocks) = content {
        if let Some(block) = blocks
            .iter_mut()
            .find(|block| BlockKind::of(block) == BlockKind::ToolResult)
        {
            set_block_field(block, "content", text);
            return;
        }
    }
    *content = Value::String(text.to_string());
}

fn overwrite_assistant(record: &mut Record, text: &str, intent: Intent) -> Option<()> {
    let blocks = match record.message_content_mut()? {
        Value::Array(blocks) => blocks,
        other => {
            *other = Value::String(text.to_string());
            return Some(());
        }
    };

    let text_at = first_block(blocks, BlockKind::Text);
    let thinking_at = first_block(blocks, BlockKind::Thinking);
    let tool_use_at = first_block(blocks, BlockKind::ToolUse);

    if let Some(i) = text_at {
        set_block_field(&mut blocks[i], "text", text);
    } else if let Some(i) = thinking_at {
        set_block_field(&mut blocks[i], "thinking", text);
    } else if let Some(i) = tool_use_at {
        match intent {
            Intent::Replace => return None,
            Intent::Redact => {
                if let Some(input) = blocks[i].get_mut("input") {
                    *input = json!({ "content": REMOVED_MARKER });
                }
            }
        }
    } else {
        *blocks = vec![json!({ "type": "text", "text": text })];
    }
    Some(())
}

fn first_block(blocks: &[Value], kind: BlockKind) -> Option<usize> {
    blocks.iter().position(|block| BlockKind::of(block) == kind)
}

fn set_block_field(block: &mut Value, field: &str, text: &str) {
    if let Some(fields) = block.as_object_mut() {
        fields.insert(field.to_string(), Value::String(text.to_string()));
    }
}

fn put_message_content(record: &mut Record, content: Value) {
    if let Some(slot) = record.message_content_mut() {
        *slot = content;
        return;
    }
    match record.get("message").and_then(Value::as_object).cloned() {
        Some(mut message) => {
            message.insert("content".to_string(), content);
            record.set("message", Value::Object(message));
        }
        None => record.set("message", json!({ "content": content })),
    }
}
