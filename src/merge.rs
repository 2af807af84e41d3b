use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::{ConflictRule, Multiplicity, SourceSpec};
use crate::models::{Record, Slot, StudentKey, UnifiedStudentRecord};
use crate::sources::RawDataset;

pub type KeyedRecords = BTreeMap<StudentKey, Record>;
pub type KeyedLists = BTreeMap<StudentKey, Vec<Record>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub source: String,
    pub rows_read: usize,
    pub rows_excluded: usize,
    pub keys_dropped: usize,
    pub keys: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub records: BTreeMap<StudentKey, UnifiedStudentRecord>,
    pub stats: Vec<SourceStats>,
}

pub fn key_rows(
    spec: &SourceSpec,
    rows: &[Record],
    stats: &mut SourceStats,
) -> Vec<(StudentKey, Record)> {
    let mut keyed = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        stats.rows_read += 1;
        if let Some(rule) = &spec.include {
            if !rule.admits(row) {
                stats.rows_excluded += 1;
                continue;
            }
        }

        let raw_key = row.get(&spec.key_column).unwrap_or_default();
        match StudentKey::extract(raw_key) {
            Some(key) => keyed.push((key, row.clone())),
            None => {
                stats.keys_dropped += 1;
                warn!(
                    source = %spec.name,
                    row = index + 2,
                    value = raw_key,
                    "dropping row without a student key"
                );
            }
        }
    }
    keyed
}

/// One record per key. With a conflict rule the preferred record wins;
/// without one the last row wins.
pub fn group_single(
    keyed: impl IntoIterator<Item = (StudentKey, Record)>,
    conflict: Option<&ConflictRule>,
) -> KeyedRecords {
    let mut grouped = KeyedRecords::new();
    for (key, record) in keyed {
        match grouped.get_mut(&key) {
            Some(current) => {
                let replace = conflict.map_or(true, |rule| rule.prefers(&record, current));
                if replace {
                    *current = record;
                }
            }
            None => {
                grouped.insert(key, record);
            }
        }
    }
    grouped
}

pub fn group_many(keyed: impl IntoIterator<Item = (StudentKey, Record)>) -> KeyedLists {
    let mut grouped = KeyedLists::new();
    for (key, record) in keyed {
        grouped.entry(key).or_default().push(record);
    }
    grouped
}

pub fn collect_slots(
    spec: &SourceSpec,
    rows: &[Record],
) -> (BTreeMap<StudentKey, Slot>, SourceStats) {
    let mut stats = SourceStats {
        source: spec.name.clone(),
        ..SourceStats::default()
    };
    let keyed = key_rows(spec, rows, &mut stats);

    let slots: BTreeMap<StudentKey, Slot> = match spec.multiplicity {
        Multiplicity::Single => group_single(keyed, spec.conflict.as_ref())
            .into_iter()
            .map(|(key, record)| (key, Slot::Single(record)))
            .collect(),
        Multiplicity::Many => group_many(keyed)
            .into_iter()
            .map(|(key, records)| (key, Slot::Many(records)))
            .collect(),
    };
    stats.keys = slots.len();
    (slots, stats)
}

pub fn merge_sources(specs: &[SourceSpec], datasets: &[RawDataset]) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for spec in specs {
        let rows = datasets
            .iter()
            .find(|dataset| dataset.name == spec.name)
            .map(|dataset| dataset.rows.as_slice())
            .unwrap_or_default();

        let (slots, stats) = collect_slots(spec, rows);
        debug!(
            source = %spec.name,
            rows = stats.rows_read,
            excluded = stats.rows_excluded,
            dropped = stats.keys_dropped,
            keys = stats.keys,
            "merged source"
        );

        for (key, slot) in slots {
            outcome
                .records
                .entry(key)
                .or_insert_with(|| UnifiedStudentRecord::new(key))
                .slots
                .insert(spec.name.clone(), slot);
        }
        outcome.stats.push(stats);
    }

    outcome
}

pub fn inner_join(left: &KeyedRecords, right: &KeyedRecords) -> KeyedRecords {
    left.iter()
        .filter_map(|(key, record)| {
            let other = right.get(key)?;
            let mut merged = record.clone();
            merged.merge_from(other);
            Some((*key, merged))
        })
        .collect()
}

/// Every primary key survives. Unmatched keys gain a null placeholder for
/// each `secondary_fields` entry the primary record does not already carry.
pub fn left_join(
    primary: &KeyedRecords,
    secondary: &KeyedRecords,
    secondary_fields: &[String],
) -> KeyedRecords {
    primary
        .iter()
        .map(|(key, record)| {
            let mut merged = record.clone();
            match secondary.get(key) {
                Some(other) => merged.merge_from(other),
                None => {
                    for field in secondary_fields {
                        if !merged.contains_field(field) {
                            merged.set(field.clone(), None);
                        }
                    }
                }
            }
            (*key, merged)
        })
        .collect()
}

pub fn set_difference<V: Clone, W>(
    a: &BTreeMap<StudentKey, V>,
    b: &BTreeMap<StudentKey, W>,
) -> BTreeMap<StudentKey, V> {
    a.iter()
        .filter(|(key, _)| !b.contains_key(key))
        .map(|(key, value)| (*key, value.clone()))
        .collect()
}
