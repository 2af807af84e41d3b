use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SyncError;
use crate::layout;
use crate::models::{PersistedRow, StudentKey};

/// The published table. Positions are zero-based data-row indexes in table
/// order; a header, if the medium has one, is not a position.
#[async_trait]
pub trait TargetTable: Send {
    fn describe(&self) -> String;

    async fn read_all_rows(&mut self) -> Result<Vec<PersistedRow>, SyncError>;

    async fn update_row(&mut self, position: usize, cells: &[String]) -> Result<(), SyncError>;

    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SyncError>;

    async fn flush(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

pub fn persisted_row(position: usize, cells: Vec<String>) -> PersistedRow {
    let key = cells
        .get(layout::STUDENT_KEY)
        .and_then(|cell| StudentKey::extract(cell));
    PersistedRow { position, key, cells }
}

#[derive(Debug)]
pub struct CsvTable {
    path: PathBuf,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    dirty: bool,
}

impl CsvTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SyncError::TargetMissing(path.display().to_string()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut records = reader.records();

        let header: Vec<String> = match records.next() {
            Some(header) => header?.iter().map(str::to_string).collect(),
            None => {
                return Err(SyncError::Target(format!(
                    "{} has no header row",
                    path.display()
                )))
            }
        };

        let mut rows = Vec::new();
        for record in records {
            rows.push(record?.iter().map(str::to_string).collect());
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
            dirty: false,
        })
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let mut table = Self {
            path: path.as_ref().to_path_buf(),
            header: layout::headers(),
            rows: Vec::new(),
            dirty: true,
        };
        table.write_file()?;
        Ok(table)
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    fn write_file(&mut self) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;
            writer.write_record(&self.header)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        debug!(path = %self.path.display(), rows = self.rows.len(), "wrote published table");
        Ok(())
    }
}

#[async_trait]
impl TargetTable for CsvTable {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_all_rows(&mut self) -> Result<Vec<PersistedRow>, SyncError> {
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(position, cells)| persisted_row(position, cells.clone()))
            .collect())
    }

    async fn update_row(&mut self, position: usize, cells: &[String]) -> Result<(), SyncError> {
        let row = self.rows.get_mut(position).ok_or_else(|| {
            SyncError::Target(format!("row position {position} is past the end of the table"))
        })?;
        *row = cells.to_vec();
        self.dirty = true;
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SyncError> {
        self.rows.extend(rows.iter().cloned());
        self.dirty |= !rows.is_empty();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SyncError> {
        if self.dirty {
            self.write_file()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryTable {
    pub rows: Vec<Vec<String>>,
    pub updates: Vec<usize>,
    pub appended: usize,
}

#[cfg(test)]
impl MemoryTable {
    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn reset_log(&mut self) {
        self.updates.clear();
        self.appended = 0;
    }
}

#[cfg(test)]
#[async_trait]
impl TargetTable for MemoryTable {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn read_all_rows(&mut self) -> Result<Vec<PersistedRow>, SyncError> {
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(position, cells)| persisted_row(position, cells.clone()))
            .collect())
    }

    async fn update_row(&mut self, position: usize, cells: &[String]) -> Result<(), SyncError> {
        let row = self
            .rows
            .get_mut(position)
            .ok_or_else(|| SyncError::Target(format!("no row {position}")))?;
        *row = cells.to_vec();
        self.updates.push(position);
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SyncError> {
        self.rows.extend(rows.iter().cloned());
        self.appended += rows.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(key: &str, last: &str) -> Vec<String> {
        let mut cells = vec![String::new(); layout::WIDTH];
        cells[layout::STUDENT_KEY] = key.to_string();
        cells[layout::LAST_NAME] = last.to_string();
        cells
    }

    #[test]
    fn missing_table_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let result = CsvTable::open(dir.path().join("published.csv"));
        assert!(matches!(result, Err(SyncError::TargetMissing(_))));
    }

    #[tokio::test]
    async fn edits_persist_after_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("published.csv");
        let mut table = CsvTable::create(&path).expect("create");

        table
            .append_rows(&[row("123456", "Doe"), row("", "Notes row")])
            .await
            .expect("append");
        table.update_row(0, &row("123456", "Dough")).await.expect("update");
        assert!(table.update_row(5, &row("1", "x")).await.is_err());
        table.flush().await.expect("flush");

        let mut reopened = CsvTable::open(&path).expect("reopen");
        let rows = reopened.read_all_rows().await.expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, StudentKey::new(123456));
        assert_eq!(rows[0].cells[layout::LAST_NAME], "Dough");
        assert_eq!(rows[1].key, None);
        assert_eq!(rows[1].position, 1);
    }
}
