use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::eligibility::EligibilityFilter;
use crate::error::SyncError;
use crate::merge::{self, SourceStats};
use crate::models::{DuplicateKey, EligibilityDecision, StudentKey};
use crate::rows::{RowBuilder, SourceSlots};
use crate::sources::{BackupRegistrations, RawDataset, SourceLoader};
use crate::table::TargetTable;
use crate::upsert::{self, MergePlan, PlanAction};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub today: NaiveDate,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub dry_run: bool,
    pub students_processed: usize,
    pub rows_written: usize,
    pub duplicate_keys: Vec<DuplicateKey>,
    pub updated: usize,
    pub inserted: usize,
    pub preserved: usize,
    pub untouched: usize,
    pub included: usize,
    pub reinstated: usize,
    pub excluded_withdrawn: usize,
    pub excluded_other: usize,
    pub error_rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub plan: MergePlan,
    pub decisions: BTreeMap<StudentKey, EligibilityDecision>,
    pub errors: Vec<(StudentKey, String)>,
    pub source_stats: Vec<SourceStats>,
}

pub async fn run_merge<T>(
    config: &SyncConfig,
    loader: &dyn SourceLoader,
    table: &mut T,
    options: RunOptions,
) -> Result<RunReport, SyncError>
where
    T: TargetTable + ?Sized,
{
    let run_id = Uuid::new_v4();
    run(run_id, config, loader, table, options)
        .instrument(info_span!("sync_run", %run_id))
        .await
}

async fn run<T>(
    run_id: Uuid,
    config: &SyncConfig,
    loader: &dyn SourceLoader,
    table: &mut T,
    options: RunOptions,
) -> Result<RunReport, SyncError>
where
    T: TargetTable + ?Sized,
{
    let holidays = config.holiday_calendar()?;
    info!(
        target_table = %table.describe(),
        today = %options.today,
        dry_run = options.dry_run,
        "starting run"
    );

    // Reading the target first makes a missing table abort the run before
    // any source work or writes happen.
    let persisted = table.read_all_rows().await?;

    let datasets: Vec<RawDataset> = config.sources.iter().map(|spec| loader.load(spec)).collect();
    let merged = merge::merge_sources(&config.sources, &datasets);
    let backup_rows = loader.load(&config.backup_source);
    let backup = BackupRegistrations::from_dataset(&config.backup_source, &backup_rows);
    info!(students = merged.records.len(), backup = backup.len(), "merged sources");

    let filtered = EligibilityFilter::from_config(config).apply(merged.records);

    let slots = SourceSlots::from_config(config);
    let builder = RowBuilder::new(
        &slots,
        &holidays,
        &backup,
        &config.markers,
        config.calendar.early_notice_workdays,
        options.today,
    );
    let mut rows = builder.build_all(filtered.kept.values());
    upsert::sort_rows(&mut rows);
    let errors: Vec<(StudentKey, String)> = rows
        .iter()
        .filter_map(|row| row.error.clone().map(|reason| (row.key, reason)))
        .collect();

    let plan = upsert::plan(&rows, &persisted);
    let (rows_written, duplicate_keys) = if options.dry_run {
        (0, plan.existing_duplicates.clone())
    } else {
        let outcome = upsert::apply_plan(table, &plan).await?;
        (outcome.rows_written, outcome.duplicate_keys)
    };

    let summary = RunSummary {
        run_id,
        today: options.today,
        dry_run: options.dry_run,
        students_processed: rows.len(),
        rows_written,
        duplicate_keys,
        updated: plan.count(PlanAction::Update),
        inserted: plan.count(PlanAction::Insert),
        preserved: plan.count(PlanAction::Preserve),
        untouched: plan.untouched,
        included: filtered.count(EligibilityDecision::Include),
        reinstated: filtered.count(EligibilityDecision::Reinstated),
        excluded_withdrawn: filtered.count(EligibilityDecision::ExcludeWithdrawn),
        excluded_other: filtered.count(EligibilityDecision::ExcludeOther),
        error_rows: errors.len(),
    };
    info!(
        processed = summary.students_processed,
        written = summary.rows_written,
        duplicates = summary.duplicate_keys.len(),
        errors = summary.error_rows,
        "run finished"
    );

    Ok(RunReport {
        summary,
        plan,
        decisions: filtered.decisions,
        errors,
        source_stats: merged.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::models::PersistedRow;
    use crate::sources::CsvSourceDir;
    use crate::table::{CsvTable, MemoryTable};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_sources(dir: &Path) {
        let files = [
            (
                "registration.csv",
                "Timestamp,Student ID,Student Last Name,Student First Name,Grade,\
                 Placement Days,Educational Factors,Placement Reason\n\
                 1/5/2024 08:00:00,Doe Jane (123456),Doe,Jane,10,10,504 plan,Attendance\n\
                 3/1/2024 08:00:00,Doe Jane (123456),Doe,Jane,10,15,504 plan,Attendance\n\
                 2/1/2024 09:30:00,234567,Roe,Lee,11,,ESL,Behavior\n\
                 2/2/2024 09:30:00,345678,Poe,Max,9,,,Behavior\n\
                 2/3/2024 09:30:00,unknown,Nobody,Here,9,5,,\n\
                 2/5/2024 09:30:00,567890,,,9,5,,\n",
            ),
            (
                "enrollment.csv",
                "Student Name,Entry Date,Grade\n\
                 \"Doe, Jane (123456)\",3/4/2024,10\n\
                 \"Roe, Lee (234567)\",3/4/2024,11\n\
                 \"Poe, Max (345678)\",3/4/2024,9\n",
            ),
            (
                "schedules.csv",
                "Student ID,Period,Course,Teacher,Entry Date,Withdraw Date\n\
                 123456,1,Algebra,Mr. Lin,3/4/2024,\n\
                 234567,2,Biology,Ms. Ray,3/4/2024,3/6/2024\n\
                 345678,3,History,Ms. Park,3/4/2024,\n",
            ),
            (
                "withdrawals.csv",
                "Student ID,Withdraw Date\n234567,3/6/2024\n345678,3/6/2024\n",
            ),
            ("contacts.csv", "Student ID,Parent Name\n999999,Nobody\n123456,Pat Doe\n"),
            (
                "registration_backup.csv",
                "Timestamp,Student ID,Placement Days\n1/1/2024,345678,20\n",
            ),
        ];
        for (name, body) in files {
            fs::write(dir.join(name), body).expect("write source");
        }
    }

    fn options(dry_run: bool) -> RunOptions {
        RunOptions {
            today: NaiveDate::from_ymd_opt(2024, 3, 8).expect("date"),
            dry_run,
        }
    }

    fn key(value: u64) -> StudentKey {
        StudentKey::new(value).expect("key")
    }

    #[tokio::test]
    async fn full_run_then_idempotent_rerun() {
        let dir = tempdir().expect("tempdir");
        write_sources(dir.path());
        let config = SyncConfig::default();
        let loader = CsvSourceDir::new(dir.path());
        let mut table = MemoryTable::default();

        let report = run_merge(&config, &loader, &mut table, options(false))
            .await
            .expect("first run");
        let summary = &report.summary;
        assert_eq!(summary.students_processed, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.rows_written, 3);
        assert_eq!(summary.error_rows, 1);
        assert_eq!(summary.reinstated, 1);
        assert_eq!(summary.excluded_withdrawn, 1);
        assert_eq!(summary.excluded_other, 1);
        assert_eq!(report.decisions[&key(234567)], EligibilityDecision::ExcludeWithdrawn);
        assert_eq!(report.decisions[&key(345678)], EligibilityDecision::Reinstated);
        assert_eq!(report.decisions[&key(999999)], EligibilityDecision::ExcludeOther);
        assert_eq!(report.errors, vec![(key(567890), "no student name in any source".to_string())]);

        // Error row sorts first, then Doe, then Poe.
        let keys: Vec<&str> = table
            .rows
            .iter()
            .map(|row| row[layout::STUDENT_KEY].as_str())
            .collect();
        assert_eq!(keys, vec!["567890", "123456", "345678"]);

        let jane = &table.rows[1];
        assert_eq!(jane[layout::PLACEMENT_DAYS], "15");
        assert_eq!(jane[layout::PROJECTED_EXIT], "2024-03-25");
        assert_eq!(jane[layout::DAYS_LEFT], "10");
        assert_eq!(jane[layout::HAS_504], "TRUE");
        assert_eq!(jane[layout::PARENT_NAME], "Pat Doe");
        assert_eq!(jane[layout::period_cell(1, layout::period::COURSE)], "Algebra");

        let max = &table.rows[2];
        assert_eq!(max[layout::PLACEMENT_DAYS], "20");
        assert_eq!(max[layout::period_cell(3, layout::period::TEACHER)], "Ms. Park");

        table.reset_log();
        let again = run_merge(&config, &loader, &mut table, options(false))
            .await
            .expect("second run");
        assert_eq!(again.summary.rows_written, 0);
        assert_eq!(again.summary.updated, 0);
        assert_eq!(again.summary.inserted, 0);
        assert_eq!(again.summary.preserved, 3);
        assert!(table.updates.is_empty());
        assert_eq!(table.appended, 0);
    }

    #[tokio::test]
    async fn dry_run_leaves_target_alone() {
        let dir = tempdir().expect("tempdir");
        write_sources(dir.path());
        let mut table = MemoryTable::default();

        let loader = CsvSourceDir::new(dir.path());
        let report = run_merge(&SyncConfig::default(), &loader, &mut table, options(true))
            .await
            .expect("dry run");
        assert_eq!(report.summary.inserted, 3);
        assert_eq!(report.summary.rows_written, 0);
        assert!(table.rows.is_empty());
    }

    #[tokio::test]
    async fn existing_rows_are_preserved_and_duplicates_reported() {
        let dir = tempdir().expect("tempdir");
        write_sources(dir.path());
        let path = dir.path().join("published.csv");
        let mut seeded = CsvTable::create(&path).expect("create");
        let mut stale = vec![String::new(); layout::WIDTH];
        stale[layout::STUDENT_KEY] = "99".to_string();
        stale[layout::LAST_NAME] = "Former".to_string();
        seeded
            .append_rows(&[stale.clone(), stale.clone()])
            .await
            .expect("seed");
        seeded.flush().await.expect("flush");

        let mut table = CsvTable::open(&path).expect("open");
        let loader = CsvSourceDir::new(dir.path());
        let report = run_merge(&SyncConfig::default(), &loader, &mut table, options(false))
            .await
            .expect("run");

        assert_eq!(
            report.summary.duplicate_keys,
            vec![DuplicateKey {
                key: key(99),
                positions: vec![0, 1],
            }]
        );
        let reopened = CsvTable::open(&path).expect("reopen");
        assert_eq!(reopened.rows().len(), 5);
        assert_eq!(reopened.rows()[0], stale);
        assert_eq!(reopened.rows()[1], stale);
    }

    #[tokio::test]
    async fn renamed_sources_feed_the_row_builder() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("reg.csv"),
            "ID,Student Last Name,Student First Name,Grade,Placement Days\n123456,Doe,Jane,10,10\n",
        )
        .expect("write reg");
        fs::write(
            dir.path().join("sched.csv"),
            "ID,Period,Course,Entry Date,Dropped\n\
             123456,1,Algebra,3/4/2024,\n\
             123456,2,Chemistry,3/6/2024,3/7/2024\n",
        )
        .expect("write sched");

        let config = SyncConfig::from_toml(
            r#"
            [[sources]]
            name = "reg"
            file = "reg.csv"
            key_column = "ID"
            multiplicity = "single"
            role = "roster"

            [[sources]]
            name = "sched"
            file = "sched.csv"
            key_column = "ID"
            multiplicity = "many"
            role = "schedule"
            include = { rule = "exclude_if_present", field = "Dropped" }
            "#,
        )
        .expect("config parses");
        config.validate().expect("valid");

        let mut table = MemoryTable::default();
        let report = run_merge(&config, &CsvSourceDir::new(dir.path()), &mut table, options(false))
            .await
            .expect("run");

        assert!(report.errors.is_empty());
        let row = &table.rows[0];
        assert_eq!(row[layout::LAST_NAME], "Doe");
        assert_eq!(row[layout::FIRST_NAME], "Jane");
        assert_eq!(row[layout::GRADE], "10");
        assert_eq!(row[layout::period_cell(1, layout::period::COURSE)], "Algebra");
        assert_eq!(row[layout::period_cell(2, layout::period::COURSE)], "");
        assert_eq!(row[layout::ENTRY_DATE], "2024-03-04");
        assert_eq!(row[layout::PLACEMENT_DAYS], "10");
        assert_eq!(row[layout::PROJECTED_EXIT], "2024-03-18");
    }

    #[tokio::test]
    async fn missing_target_aborts_before_loading() {
        struct PanickingLoader;

        impl SourceLoader for PanickingLoader {
            fn load(&self, _spec: &crate::config::SourceSpec) -> RawDataset {
                panic!("sources must not be read when the target is missing");
            }
        }

        struct MissingTable;

        #[async_trait::async_trait]
        impl TargetTable for MissingTable {
            fn describe(&self) -> String {
                "missing".to_string()
            }

            async fn read_all_rows(&mut self) -> Result<Vec<PersistedRow>, SyncError> {
                Err(SyncError::TargetMissing("published".to_string()))
            }

            async fn update_row(
                &mut self,
                _position: usize,
                _cells: &[String],
            ) -> Result<(), SyncError> {
                panic!("no writes expected");
            }

            async fn append_rows(&mut self, _rows: &[Vec<String>]) -> Result<(), SyncError> {
                panic!("no writes expected");
            }
        }

        let config = SyncConfig::default();
        let result = run_merge(&config, &PanickingLoader, &mut MissingTable, options(false)).await;
        assert!(matches!(result, Err(SyncError::TargetMissing(_))));
    }
}
