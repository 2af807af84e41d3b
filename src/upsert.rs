use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::layout;
use crate::models::{DuplicateKey, OutputRow, PersistedRow, StudentKey};
use crate::table::TargetTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Update,
    Insert,
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub key: StudentKey,
    pub action: PlanAction,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub entries: Vec<PlanEntry>,
    pub updates: Vec<(usize, Vec<String>)>,
    pub inserts: Vec<Vec<String>>,
    pub untouched: usize,
    pub existing_duplicates: Vec<DuplicateKey>,
}

impl MergePlan {
    pub fn count(&self, action: PlanAction) -> usize {
        self.entries.iter().filter(|entry| entry.action == action).count()
    }

    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub rows_written: usize,
    pub duplicate_keys: Vec<DuplicateKey>,
}

// Case-insensitive (last, first), key as tiebreaker.
fn sort_key(row: &OutputRow) -> (String, String, StudentKey) {
    (
        row.sort_last.to_lowercase(),
        row.sort_first.to_lowercase(),
        row.key,
    )
}

pub fn sort_rows(rows: &mut [OutputRow]) {
    rows.sort_by_cached_key(sort_key);
}

pub fn index_rows(persisted: &[PersistedRow]) -> BTreeMap<StudentKey, usize> {
    let mut index = BTreeMap::new();
    for (slot, row) in persisted.iter().enumerate() {
        if let Some(key) = row.key {
            index.entry(key).or_insert(slot);
        }
    }
    index
}

pub fn find_duplicate_keys(rows: &[PersistedRow]) -> Vec<DuplicateKey> {
    let mut positions: BTreeMap<StudentKey, Vec<usize>> = BTreeMap::new();
    for row in rows {
        if let Some(key) = row.key {
            positions.entry(key).or_default().push(row.position);
        }
    }
    positions
        .into_iter()
        .filter(|(_, positions)| positions.len() > 1)
        .map(|(key, positions)| DuplicateKey { key, positions })
        .collect()
}

fn cell(cells: &[String], column: usize) -> &str {
    cells.get(column).map(String::as_str).unwrap_or_default()
}

fn owned_cells_equal(persisted: &[String], fresh: &[String]) -> bool {
    let mut columns = layout::BUILDER_OWNED;
    columns.all(|column| cell(persisted, column) == cell(fresh, column))
}

fn merge_cells(persisted: &[String], fresh: &[String]) -> Vec<String> {
    let width = layout::WIDTH.max(persisted.len());
    (0..width)
        .map(|column| {
            if layout::BUILDER_OWNED.contains(&column) {
                cell(fresh, column).to_string()
            } else {
                cell(persisted, column).to_string()
            }
        })
        .collect()
}

fn padded(cells: &[String]) -> Vec<String> {
    let mut cells = cells.to_vec();
    if cells.len() < layout::WIDTH {
        cells.resize(layout::WIDTH, String::new());
    }
    cells
}

pub fn plan(rows: &[OutputRow], persisted: &[PersistedRow]) -> MergePlan {
    let index = index_rows(persisted);
    let mut ordered: Vec<&OutputRow> = rows.iter().collect();
    ordered.sort_by_cached_key(|row| sort_key(row));

    let mut plan = MergePlan {
        existing_duplicates: find_duplicate_keys(persisted),
        ..MergePlan::default()
    };
    let mut targeted: BTreeSet<usize> = BTreeSet::new();
    let mut pending: BTreeMap<StudentKey, usize> = BTreeMap::new();

    for row in ordered {
        if let Some(&slot) = index.get(&row.key) {
            let existing = &persisted[slot];
            if !targeted.insert(existing.position) {
                warn!(key = %row.key, "student built twice; keeping the first row");
                continue;
            }
            let action = if owned_cells_equal(&existing.cells, &row.cells) {
                PlanAction::Preserve
            } else {
                plan.updates
                    .push((existing.position, merge_cells(&existing.cells, &row.cells)));
                PlanAction::Update
            };
            plan.entries.push(PlanEntry {
                key: row.key,
                action,
                position: Some(existing.position),
            });
        } else if pending.contains_key(&row.key) {
            warn!(key = %row.key, "student built twice; keeping the first row");
        } else {
            pending.insert(row.key, plan.inserts.len());
            plan.inserts.push(padded(&row.cells));
            plan.entries.push(PlanEntry {
                key: row.key,
                action: PlanAction::Insert,
                position: None,
            });
        }
    }

    for row in persisted {
        if targeted.contains(&row.position) {
            continue;
        }
        plan.untouched += 1;
        if let Some(key) = row.key {
            plan.entries.push(PlanEntry {
                key,
                action: PlanAction::Preserve,
                position: Some(row.position),
            });
        }
    }

    plan
}

/// Writes updates one row at a time, then all inserts as one batch, then
/// re-scans the table for duplicate keys. Duplicates are reported, not fixed.
pub async fn apply_plan<T>(table: &mut T, plan: &MergePlan) -> Result<ApplyOutcome, SyncError>
where
    T: TargetTable + ?Sized,
{
    for (position, cells) in &plan.updates {
        table.update_row(*position, cells).await?;
    }
    if !plan.inserts.is_empty() {
        table.append_rows(&plan.inserts).await?;
    }
    table.flush().await?;

    let rescanned = table.read_all_rows().await?;
    let duplicate_keys = find_duplicate_keys(&rescanned);
    for duplicate in &duplicate_keys {
        warn!(
            key = %duplicate.key,
            positions = ?duplicate.positions,
            "duplicate student key in published table"
        );
    }

    let rows_written = plan.updates.len() + plan.inserts.len();
    info!(
        updated = plan.updates.len(),
        inserted = plan.inserts.len(),
        untouched = plan.untouched,
        "applied merge plan"
    );
    Ok(ApplyOutcome {
        rows_written,
        duplicate_keys,
    })
}
