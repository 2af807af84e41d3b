use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::SyncError;
use crate::layout;
use crate::models::{PersistedRow, StudentKey};
use crate::table::{persisted_row, CsvTable, TargetTable};

const PUBLISHED_TABLE: &str = "student_sync.published_rows";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgTable {
    pool: PgPool,
}

impl PgTable {
    /// Fails with `TargetMissing` when the schema has not been created.
    pub async fn open(pool: PgPool) -> Result<Self, SyncError> {
        let present: bool = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(PUBLISHED_TABLE)
            .fetch_one(&pool)
            .await?
            .get("present");

        if !present {
            return Err(SyncError::TargetMissing(PUBLISHED_TABLE.to_string()));
        }
        Ok(Self { pool })
    }
}

fn key_text(cells: &[String]) -> Option<String> {
    cells
        .get(layout::STUDENT_KEY)
        .and_then(|cell| StudentKey::extract(cell))
        .map(|key| key.to_string())
}

fn to_position(position: usize) -> Result<i32, SyncError> {
    i32::try_from(position)
        .map_err(|_| SyncError::Target(format!("row position {position} out of range")))
}

#[async_trait]
impl TargetTable for PgTable {
    fn describe(&self) -> String {
        format!("postgres:{PUBLISHED_TABLE}")
    }

    async fn read_all_rows(&mut self) -> Result<Vec<PersistedRow>, SyncError> {
        let records = sqlx::query(
            "SELECT position, cells FROM student_sync.published_rows ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let position: i32 = record.get("position");
            let cells: Vec<String> = record.get("cells");
            let position = usize::try_from(position)
                .map_err(|_| SyncError::Target(format!("negative row position {position}")))?;
            rows.push(persisted_row(position, cells));
        }
        Ok(rows)
    }

    async fn update_row(&mut self, position: usize, cells: &[String]) -> Result<(), SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE student_sync.published_rows
            SET cells = $2, student_key = $3, updated_at = now()
            WHERE position = $1
            "#,
        )
        .bind(to_position(position)?)
        .bind(cells.to_vec())
        .bind(key_text(cells))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Target(format!("no published row at position {position}")));
        }
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        let next: i32 = sqlx::query(
            "SELECT COALESCE(MAX(position) + 1, 0) AS next FROM student_sync.published_rows",
        )
        .fetch_one(&mut *tx)
        .await?
        .get("next");

        for (offset, cells) in rows.iter().enumerate() {
            let position = next + to_position(offset)?;
            sqlx::query(
                r#"
                INSERT INTO student_sync.published_rows (position, student_key, cells)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(position)
            .bind(key_text(cells))
            .bind(cells.clone())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let source = CsvTable::open(csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;
    let mut table = PgTable::open(pool.clone())
        .await
        .context("published table missing; run init-db first")?;

    let rows = source.rows().to_vec();
    table.append_rows(&rows).await?;
    Ok(rows.len())
}
