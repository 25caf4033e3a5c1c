//! Temporal and parent-link repair over decoded entries.

use std::collections::BTreeSet;

use crate::{format_timestamp_millis, parse_timestamp_millis, Entry};

pub const MAX_TIMESTAMP_PASSES: usize = 10;

const ONE_SECOND_MILLIS: i128 = 1_000;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RepairReport {
    /// Indices of entries that were rewritten, ascending.
    pub changed: Vec<usize>,
    pub passes: usize,
    /// False when the pass budget ran out with an inversion still present.
    pub converged: bool,
}

impl RepairReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Makes timestamps non-decreasing, best effort.
///
/// An entry older than its predecessor is moved to the midpoint between the
/// predecessor and its successor when the successor is strictly newer than
/// the predecessor, or to one second after the predecessor otherwise. Passes
/// repeat until one makes no change, up to [`MAX_TIMESTAMP_PASSES`]. Entries
/// without a parseable timestamp are never compared.
pub fn repair_timestamps(entries: &mut [Entry]) -> RepairReport {
    let mut changed = BTreeSet::new();
    let mut passes = 0;
    let mut converged = false;

    while passes < MAX_TIMESTAMP_PASSES {
        passes += 1;
        let mut fixed_any = false;

        for i in 1..entries.len() {
            let (Some(prev), Some(curr)) = (millis_at(entries, i - 1), millis_at(entries, i))
            else {
                continue;
            };
            if prev <= curr {
                continue;
            }

            let corrected = match millis_at(entries, i + 1) {
                Some(next) if next > prev => (prev + next) / 2,
                _ => prev + ONE_SECOND_MILLIS,
            };
            let Some(formatted) = format_timestamp_millis(corrected) else {
                continue;
            };

            entries[i].record.set_timestamp(formatted);
            changed.insert(entries[i].index);
            fixed_any = true;
        }

        if !fixed_any {
            converged = true;
            break;
        }
    }

    if !converged {
        converged = (1..entries.len()).all(|i| {
            match (millis_at(entries, i - 1), millis_at(entries, i)) {
                (Some(prev), Some(curr)) => prev <= curr,
                _ => true,
            }
        });
    }

    RepairReport {
        changed: changed.into_iter().collect(),
        passes,
        converged,
    }
}

/// Points every present `parentUuid` at the preceding entry's `uuid`.
///
/// Assumes a strictly linear chain: an entry deliberately parented to an
/// older ancestor is indistinguishable from a broken link and gets relinked.
pub fn repair_parent_links(entries: &mut [Entry]) -> RepairReport {
    let mut changed = Vec::new();

    for i in 1..entries.len() {
        let Some(prev_uuid) = entries[i - 1].record.uuid().map(str::to_string) else {
            continue;
        };
        let needs_fix = entries[i]
            .record
            .parent_uuid()
            .is_some_and(|parent| parent != prev_uuid);
        if needs_fix {
            entries[i].record.set_parent_uuid(&prev_uuid);
            changed.push(entries[i].index);
        }
    }

    RepairReport {
        changed,
        passes: 1,
        converged: true,
    }
}

/// Runs timestamp repair, then parent-link repair.
pub fn repair_all(entries: &mut [Entry]) -> RepairReport {
    let temporal = repair_timestamps(entries);
    let linkage = repair_parent_links(entries);

    let changed: BTreeSet<usize> = temporal
        .changed
        .into_iter()
        .chain(linkage.changed)
        .collect();
    RepairReport {
        changed: changed.into_iter().collect(),
        passes: temporal.passes,
        converged: temporal.converged,
    }
}

fn millis_at(entries: &[Entry], i: usize) -> Option<i128> {
    entries
        .get(i)
        .and_then(|entry| entry.record.timestamp())
        .and_then(parse_timestamp_millis)
}
