use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::calendar;
use crate::catalog::fields;
use crate::config::SourceSpec;
use crate::merge::{self, KeyedRecords, SourceStats};
use crate::models::{Record, StudentKey};

#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl RawDataset {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Supplies source snapshots. Must never fail: a missing or unreadable
/// source is reported and comes back empty.
pub trait SourceLoader {
    fn load(&self, spec: &SourceSpec) -> RawDataset;
}

#[derive(Debug, Clone)]
pub struct CsvSourceDir {
    root: PathBuf,
}

impl CsvSourceDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, spec: &SourceSpec, path: &Path) -> Result<RawDataset, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_path(path)?;

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut dataset = RawDataset {
            name: spec.name.clone(),
            headers,
            rows: Vec::new(),
        };

        for (index, result) in reader.records().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    warn!(source = %spec.name, row = index + 2, %err, "skipping unreadable row");
                    continue;
                }
            };
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }

            let record = Record::from_pairs(
                dataset
                    .headers
                    .iter()
                    .enumerate()
                    .map(|(column, header)| (header.clone(), row.get(column).unwrap_or_default())),
            );
            dataset.rows.push(record);
        }

        Ok(dataset)
    }
}

impl SourceLoader for CsvSourceDir {
    fn load(&self, spec: &SourceSpec) -> RawDataset {
        let path = self.root.join(&spec.file);
        if !path.exists() {
            warn!(
                source = %spec.name,
                path = %path.display(),
                "source file missing; treating as empty"
            );
            return RawDataset::empty(&spec.name);
        }

        let dataset = match self.read(spec, &path) {
            Ok(dataset) => dataset,
            Err(err) => {
                warn!(
                    source = %spec.name,
                    path = %path.display(),
                    %err,
                    "source unreadable; treating as empty"
                );
                return RawDataset::empty(&spec.name);
            }
        };

        if !dataset.headers.iter().any(|header| *header == spec.key_column) {
            warn!(
                source = %spec.name,
                key_column = %spec.key_column,
                "key column not in header; treating as empty"
            );
            return RawDataset::empty(&spec.name);
        }
        if dataset.rows.is_empty() {
            warn!(source = %spec.name, "source has no data rows");
        }

        info!(source = %spec.name, rows = dataset.rows.len(), "loaded source");
        dataset
    }
}

/// Point lookup of placement days in the backup registration table.
pub trait BackupLookup {
    fn placement_days(&self, key: StudentKey) -> Option<u32>;
}

#[derive(Debug, Clone, Default)]
pub struct BackupRegistrations {
    by_key: KeyedRecords,
}

impl BackupRegistrations {
    pub fn from_dataset(spec: &SourceSpec, dataset: &RawDataset) -> Self {
        let mut stats = SourceStats::default();
        let keyed = merge::key_rows(spec, &dataset.rows, &mut stats);
        Self {
            by_key: merge::group_single(keyed, spec.conflict.as_ref()),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl BackupLookup for BackupRegistrations {
    fn placement_days(&self, key: StudentKey) -> Option<u32> {
        self.by_key
            .get(&key)
            .and_then(|record| record.get(fields::PLACEMENT_DAYS))
            .and_then(parse_day_count)
    }
}

pub fn parse_day_count(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if let Ok(days) = trimmed.parse::<u32>() {
        return Some(days);
    }
    match trimmed.parse::<f64>() {
        Ok(value)
            if value.is_finite()
                && value >= 0.0
                && value.fract() == 0.0
                && value <= f64::from(u32::MAX) =>
        {
            Some(value as u32)
        }
        _ => None,
    }
}

pub fn record_timestamp(record: &Record) -> Option<chrono::NaiveDateTime> {
    record.get(fields::TIMESTAMP).and_then(calendar::parse_timestamp)
}
