use std::collections::BTreeMap;

use serde_json::Value;

use crate::{LogError, Record};

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Ordinal among the non-blank lines. A malformed line still takes an
    /// index in best-effort mode, keeping indices aligned with [`apply_updates`].
    pub index: usize,
    /// Zero-based physical line in the source text.
    pub line: usize,
    pub record: Record,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SkippedLine {
    pub index: usize,
    /// One-based physical line, as shown to humans.
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub entries: Vec<Entry>,
    pub skipped: Vec<SkippedLine>,
}

/// Decodes every non-blank line, failing on the first malformed one.
///
/// # Errors
/// Returns [`LogError::MalformedRecord`] with the one-based physical line of
/// the first line that is not a JSON object.
pub fn decode_strict(text: &str) -> Result<Vec<Entry>, LogError> {
    let mut entries = Vec::new();
    for (index, (line, raw)) in non_blank_lines(text).enumerate() {
        let record = parse_line(raw).map_err(|message| LogError::MalformedRecord {
            line: line + 1,
            message: format!("{message}: {}", raw.trim()),
        })?;
        entries.push(Entry {
            index,
            line,
            record,
        });
    }
    Ok(entries)
}

/// Decodes every non-blank line, skipping the ones that fail to parse.
#[must_use]
pub fn decode_best_effort(text: &str) -> Decoded {
    let mut decoded = Decoded::default();
    for (index, (line, raw)) in non_blank_lines(text).enumerate() {
        match parse_line(raw) {
            Ok(record) => decoded.entries.push(Entry {
                index,
                line,
                record,
            }),
            Err(message) => decoded.skipped.push(SkippedLine {
                index,
                line: line + 1,
                message,
            }),
        }
    }
    decoded
}

/// Encodes records one per line. No trailing newline is added.
#[must_use]
pub fn encode(records: &[Record]) -> String {
    records
        .iter()
        .map(Record::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A sparse set of edits against transcript text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditPlan {
    pub updates: BTreeMap<usize, Record>,
    pub insert_before: BTreeMap<usize, Vec<Record>>,
    pub append: Vec<Record>,
}

impl EditPlan {
    #[must_use]
    pub fn from_updates(updates: BTreeMap<usize, Record>) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.insert_before.is_empty() && self.append.is_empty()
    }
}

/// Rewrites the lines at the given indices and leaves every other byte alone.
#[must_use]
pub fn apply_updates(text: &str, updates: &BTreeMap<usize, Record>) -> String {
    let mut out = Vec::new();
    let mut index = 0;
    for raw in text.split('\n') {
        if raw.trim().is_empty() {
            out.push(raw.to_string());
            continue;
        }
        match updates.get(&index) {
            Some(record) => out.push(rewrite_line(raw, record)),
            None => out.push(raw.to_string()),
        }
        index += 1;
    }
    out.join("\n")
}

/// Applies updates, insertions and appends in a single pass.
///
/// Insertions keyed past the last index are appended. Appended records always
/// leave the text ending in a newline.
#[must_use]
pub fn apply_plan(text: &str, plan: &EditPlan) -> String {
    let mut out = Vec::new();
    let mut index = 0;
    for raw in text.split('\n') {
        if raw.trim().is_empty() {
            out.push(raw.to_string());
            continue;
        }
        if let Some(inserted) = plan.insert_before.get(&index) {
            out.extend(inserted.iter().map(Record::to_string));
        }
        match plan.updates.get(&index) {
            Some(record) => out.push(rewrite_line(raw, record)),
            None => out.push(raw.to_string()),
        }
        index += 1;
    }

    let trailing: Vec<&Record> = plan
        .insert_before
        .range(index..)
        .flat_map(|(_, records)| records.iter())
        .chain(plan.append.iter())
        .collect();
    if trailing.is_empty() {
        return out.join("\n");
    }

    let mut result = if text.trim().is_empty() {
        String::new()
    } else {
        out.join("\n")
    };
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    for record in trailing {
        result.push_str(&record.to_string());
        result.push('\n');
    }
    result
}

fn non_blank_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split('\n')
        .enumerate()
        .filter(|(_, raw)| !raw.trim().is_empty())
}

fn parse_line(raw: &str) -> Result<Record, String> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|err| err.to_string())?;
    Record::from_value(value).ok_or_else(|| "expected a JSON object".to_string())
}

fn rewrite_line(raw: &str, record: &Record) -> String {
    if raw.ends_with('\r') {
        format!("{record}\r")
    } else {
        record.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T, LogError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn record(value: Value) -> Record {
        match Record::from_value(value) {
            Some(record) => record,
            None => panic!("fixture must be an object"),
        }
    }

    const LOG: &str = concat!(
        r#"{"uuid":"a","type":"user","message":{"role":"user","content":"hi"}}"#,
        "\n",
        r#"{"uuid":"b","parentUuid":"a","type":"assistant","message":{"content":[{"type":"text","text":"yo"}]}}"#,
        "\n"
    );

    #[test]
    fn decode_assigns_ordinal_indices() {
        let entries = must(decode_strict(LOG));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].record.uuid(), Some("b"));
    }

    #[test]
    fn blank_lines_receive_no_index() {
        let text = "{\"uuid\":\"a\"}\n\n   \n{\"uuid\":\"b\"}\n";
        let entries = must(decode_strict(text));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].line, 3);
    }

    #[test]
    fn empty_text_decodes_to_nothing() {
        assert!(must(decode_strict("")).is_empty());
        assert!(must(decode_strict("\n  \n")).is_empty());
    }

    #[test]
    fn strict_decode_fails_on_malformed_line() {
        let text = "{\"uuid\":\"a\"}\n{not json\n{\"uuid\":\"c\"}\n";
        match decode_strict(text) {
            Err(LogError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed record error, got {other:?}"),
        }
    }

    #[test]
    fn best_effort_decode_skips_malformed_line_but_keeps_its_index() {
        let text = "{\"uuid\":\"a\"}\n{not json\n{\"uuid\":\"c\"}\n";
        let decoded = decode_best_effort(text);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].index, 2);
        assert_eq!(decoded.skipped.len(), 1);
        assert_eq!(decoded.skipped[0].line, 2);
    }

    #[test]
    fn non_object_line_is_malformed() {
        assert!(decode_strict("[1,2,3]\n").is_err());
    }

    #[test]
    fn encode_round_trips_compact_input() {
        let entries = must(decode_strict(LOG));
        let records: Vec<Record> = entries.into_iter().map(|entry| entry.record).collect();
        assert_eq!(encode(&records), LOG.trim_end_matches('\n'));
    }

    #[test]
    fn apply_updates_touches_only_targeted_lines() {
        let text = "{\"uuid\":\"a\", \"x\": 1}\n{\"uuid\":\"b\"}\n";
        let mut updates = BTreeMap::new();
        updates.insert(1, record(json!({"uuid": "b", "edited": true})));

        let updated = apply_updates(text, &updates);
        assert_eq!(
            updated,
            "{\"uuid\":\"a\", \"x\": 1}\n{\"uuid\":\"b\",\"edited\":true}\n"
        );
    }

    #[test]
    fn apply_updates_preserves_missing_terminal_newline() {
        let text = "{\"uuid\":\"a\"}\n{\"uuid\":\"b\"}";
        let mut updates = BTreeMap::new();
        updates.insert(1, record(json!({"uuid": "z"})));
        assert_eq!(apply_updates(text, &updates), "{\"uuid\":\"a\"}\n{\"uuid\":\"z\"}");
    }

    #[test]
    fn apply_updates_addresses_past_blank_lines() {
        let text = "{\"uuid\":\"a\"}\n\n{\"uuid\":\"b\"}\n";
        let mut updates = BTreeMap::new();
        updates.insert(1, record(json!({"uuid": "z"})));
        assert_eq!(
            apply_updates(text, &updates),
            "{\"uuid\":\"a\"}\n\n{\"uuid\":\"z\"}\n"
        );
    }

    #[test]
    fn apply_updates_keeps_crlf_endings() {
        let text = "{\"uuid\":\"a\"}\r\n{\"uuid\":\"b\"}\r\n";
        let mut updates = BTreeMap::new();
        updates.insert(0, record(json!({"uuid": "z"})));
        assert_eq!(
            apply_updates(text, &updates),
            "{\"uuid\":\"z\"}\r\n{\"uuid\":\"b\"}\r\n"
        );
    }

    #[test]
    fn apply_plan_inserts_before_and_appends() {
        let text = "{\"uuid\":\"a\"}\n{\"uuid\":\"b\"}";
        let mut plan = EditPlan::default();
        plan.insert_before
            .insert(1, vec![record(json!({"uuid": "new"}))]);
        plan.append.push(record(json!({"uuid": "tail"})));

        assert_eq!(
            apply_plan(text, &plan),
            "{\"uuid\":\"a\"}\n{\"uuid\":\"new\"}\n{\"uuid\":\"b\"}\n{\"uuid\":\"tail\"}\n"
        );
    }

    #[test]
    fn apply_plan_appends_to_empty_text() {
        let mut plan = EditPlan::default();
        plan.append.push(record(json!({"uuid": "only"})));
        assert_eq!(apply_plan("\n", &plan), "{\"uuid\":\"only\"}\n");
    }

    #[test]
    fn empty_plan_is_identity() {
        let text = "{\"uuid\":\"a\"}\n  \n{\"uuid\":\"b\"}";
        assert_eq!(apply_plan(text, &EditPlan::default()), text);
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        ("[a-f0-9]{8}", "[ -~]{0,24}", any::<bool>()).prop_map(|(uuid, text, flag)| {
            record(json!({
                "uuid": uuid,
                "type": "user",
                "flag": flag,
                "message": {"role": "user", "content": text},
            }))
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_encode_decode_round_trip(records in prop::collection::vec(arb_record(), 0..20)) {
            let text = encode(&records);
            let decoded = must(decode_strict(&text));
            let again: Vec<Record> = decoded.into_iter().map(|entry| entry.record).collect();
            prop_assert_eq!(encode(&again), text);
        }

        #[test]
        fn prop_apply_updates_with_no_updates_is_identity(
            records in prop::collection::vec(arb_record(), 0..20),
            trailing_newline in any::<bool>(),
        ) {
            let mut text = encode(&records);
            if trailing_newline {
                text.push('\n');
            }
            prop_assert_eq!(apply_updates(&text, &BTreeMap::new()), text);
        }
    }
}
