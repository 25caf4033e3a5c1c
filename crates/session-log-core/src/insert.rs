//! Placement of synthetic summary records.

use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{format_timestamp, BlockKind, EditPlan, Entry, Record, RecordKind};

/// Session facts stamped onto a synthetic summary record.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryContext {
    pub cwd: String,
    pub session_id: String,
    pub version: String,
    pub git_branch: String,
    pub now: OffsetDateTime,
    pub record_id: Uuid,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Placement {
    /// Spliced in directly before the tool-invoking record at `index`.
    BeforeToolUse { index: usize },
    /// Appended after the last record; `index` is the new record's index.
    Appended { index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryInsertion {
    pub plan: EditPlan,
    pub record: Record,
    pub placement: Placement,
}

/// Plans the insertion of a user-role summary record.
///
/// The summary lands immediately before the last assistant record carrying a
/// tool invocation, so that invocation stays adjacent to its result, and takes the
/// displaced record's timestamp. The displaced record is re-parented onto the
/// summary. With no tool invocation in the log the summary is appended and
/// parented onto the last record that has a `uuid`.
#[must_use]
pub fn plan_summary_insertion(
    entries: &[Entry],
    summary: &str,
    ctx: &SummaryContext,
) -> SummaryInsertion {
    let record_id = ctx.record_id.to_string();
    let anchor = entries
        .iter()
        .rev()
        .find(|entry| {
            entry.record.kind() == RecordKind::Assistant
                && entry.record.has_block(BlockKind::ToolUse)
        });

    let mut plan = EditPlan::default();
    match anchor {
        Some(anchor) => {
            let timestamp = anchor
                .record
                .timestamp()
                .map_or_else(|| format_timestamp(ctx.now), str::to_string);
            let record = summary_record(ctx, summary, Value::Null, timestamp);

            let mut displaced = anchor.record.clone();
            displaced.set_parent_uuid(&record_id);

            plan.insert_before.insert(anchor.index, vec![record.clone()]);
            plan.updates.insert(anchor.index, displaced);
            SummaryInsertion {
                plan,
                record,
                placement: Placement::BeforeToolUse {
                    index: anchor.index,
                },
            }
        }
        None => {
            let parent = entries
                .iter()
                .rev()
                .find_map(|entry| entry.record.uuid())
                .map_or(Value::Null, |uuid| Value::String(uuid.to_string()));
            let record = summary_record(ctx, summary, parent, format_timestamp(ctx.now));
            let index = entries.last().map_or(0, |entry| entry.index + 1);

            plan.append.push(record.clone());
            SummaryInsertion {
                plan,
                record,
                placement: Placement::Appended { index },
            }
        }
    }
}

fn summary_record(ctx: &SummaryContext, summary: &str, parent: Value, timestamp: String) -> Record {
    let mut fields = Map::new();
    fields.insert("parentUuid".to_string(), parent);
    fields.insert("isSidechain".to_string(), Value::Bool(false));
    fields.insert("userType".to_string(), json!("external"));
    fields.insert("cwd".to_string(), json!(ctx.cwd));
    fields.insert("sessionId".to_string(), json!(ctx.session_id));
    fields.insert("version".to_string(), json!(ctx.version));
    fields.insert("gitBranch".to_string(), json!(ctx.git_branch));
    fields.insert("type".to_string(), json!("user"));
    fields.insert(
        "message".to_string(),
        json!({ "role": "user", "content": summary }),
    );
    fields.insert("isCompactSummary".to_string(), Value::Bool(true));
    fields.insert("uuid".to_string(), json!(ctx.record_id.to_string()));
    fields.insert("timestamp".to_string(), Value::String(timestamp));
    Record::new(fields)
}
