use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::calendar::{self, format_date, HolidayCalendar};
use crate::catalog::fields;
use crate::config::{Feed, FlagMarkers, SyncConfig};
use crate::error::BuildError;
use crate::layout::{self, period};
use crate::models::{OutputRow, Record, StudentKey, UnifiedStudentRecord};
use crate::sources::{parse_day_count, record_timestamp, BackupLookup};

pub const MAX_PLACEMENT_DAYS: u32 = 180;

pub const ERROR_MARKER: &str = "ERROR";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodFeedback {
    pub teacher: String,
    pub current_grade: String,
    pub missing_work: String,
    pub comments: String,
    pub submitted: Option<NaiveDateTime>,
    pub submissions: usize,
}

pub type FeedbackByPeriod = BTreeMap<usize, PeriodFeedback>;

/// Maps labels like `"Period 3"`, `"P3"`, `"3rd"` or `"3"` to a period number.
pub fn normalize_period(label: &str) -> Option<usize> {
    let digits = label
        .split(|c: char| !c.is_ascii_digit())
        .find(|run| !run.is_empty())?;
    let number: usize = digits.parse().ok()?;
    (1..=layout::PERIOD_COUNT).contains(&number).then_some(number)
}

pub fn aggregate_feedback(entries: &[Record]) -> FeedbackByPeriod {
    let mut latest: BTreeMap<usize, (&Record, Option<NaiveDateTime>, usize)> = BTreeMap::new();

    for entry in entries {
        let Some(number) = entry.get(fields::PERIOD).and_then(normalize_period) else {
            debug!(
                period = entry.get(fields::PERIOD).unwrap_or_default(),
                "feedback without a usable period"
            );
            continue;
        };
        let stamp = record_timestamp(entry);
        match latest.entry(number) {
            Entry::Vacant(slot) => {
                slot.insert((entry, stamp, 1));
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                current.2 += 1;
                if stamp >= current.1 {
                    current.0 = entry;
                    current.1 = stamp;
                }
            }
        }
    }

    latest
        .into_iter()
        .map(|(number, (record, submitted, submissions))| {
            let text = |name: &str| record.non_empty(name).unwrap_or_default().to_string();
            (
                number,
                PeriodFeedback {
                    teacher: text(fields::TEACHER),
                    current_grade: text(fields::CURRENT_GRADE),
                    missing_work: text(fields::MISSING_WORK),
                    comments: text(fields::COMMENTS),
                    submitted,
                    submissions,
                },
            )
        })
        .collect()
}

/// Splits `"Last, First"`; without a comma the last word is the last name.
/// A trailing parenthetical such as `"(1234567)"` is ignored.
pub fn parse_full_name(raw: &str) -> Option<(String, String)> {
    let name = raw.split('(').next().unwrap_or(raw).trim();
    if name.is_empty() {
        return None;
    }

    if let Some((last, first)) = name.split_once(',') {
        return Some((last.trim().to_string(), first.trim().to_string()));
    }

    let mut words: Vec<&str> = name.split_whitespace().collect();
    let last = words.pop()?;
    Some((last.to_string(), words.join(" ")))
}

fn first_non_empty<'r>(candidates: impl IntoIterator<Item = Option<&'r str>>) -> Option<&'r str> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn field<'r>(record: Option<&'r Record>, name: &str) -> Option<&'r str> {
    record.and_then(|record| record.non_empty(name))
}

fn flag(value: bool) -> String {
    let text = if value { "TRUE" } else { "FALSE" };
    text.to_string()
}

fn contains_marker(haystack: &str, marker: &str) -> bool {
    !marker.is_empty() && haystack.to_lowercase().contains(&marker.to_lowercase())
}

pub fn error_row(key: StudentKey, reason: &str) -> OutputRow {
    let mut cells = vec![String::new(); layout::WIDTH];
    cells[layout::TIMESTAMP] = ERROR_MARKER.to_string();
    cells[layout::LAST_NAME] = reason.to_string();
    cells[layout::STUDENT_KEY] = key.to_string();
    OutputRow {
        key,
        cells,
        sort_last: String::new(),
        sort_first: String::new(),
        error: Some(reason.to_string()),
    }
}

/// Slot names the builder reads, resolved from the configured sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSlots {
    pub registration: Option<String>,
    pub enrollment: Option<String>,
    pub schedules: Option<String>,
    pub contacts: Option<String>,
    pub attendance: Option<String>,
    pub feedback: Option<String>,
    pub withdraw_field: String,
}

impl SourceSlots {
    pub fn from_config(config: &SyncConfig) -> Self {
        let name = |feed| config.feed_source(feed).map(|source| source.name.clone());
        Self {
            registration: name(Feed::Registration),
            enrollment: name(Feed::Enrollment),
            schedules: config.schedule_source().map(|source| source.name.clone()),
            contacts: name(Feed::Contacts),
            attendance: name(Feed::Attendance),
            feedback: name(Feed::Feedback),
            withdraw_field: config.withdraw_field().to_string(),
        }
    }
}

fn single<'r>(record: &'r UnifiedStudentRecord, slot: Option<&str>) -> Option<&'r Record> {
    slot.and_then(|name| record.single(name))
}

fn many<'r>(record: &'r UnifiedStudentRecord, slot: Option<&str>) -> &'r [Record] {
    slot.map(|name| record.many(name)).unwrap_or_default()
}

pub struct RowBuilder<'a> {
    slots: &'a SourceSlots,
    holidays: &'a HolidayCalendar,
    backup: &'a dyn BackupLookup,
    markers: &'a FlagMarkers,
    early_notice_workdays: u32,
    today: NaiveDate,
}

impl<'a> RowBuilder<'a> {
    pub fn new(
        slots: &'a SourceSlots,
        holidays: &'a HolidayCalendar,
        backup: &'a dyn BackupLookup,
        markers: &'a FlagMarkers,
        early_notice_workdays: u32,
        today: NaiveDate,
    ) -> Self {
        Self {
            slots,
            holidays,
            backup,
            markers,
            early_notice_workdays,
            today,
        }
    }

    pub fn build_all<'r>(
        &self,
        records: impl IntoIterator<Item = &'r UnifiedStudentRecord>,
    ) -> Vec<OutputRow> {
        records.into_iter().map(|record| self.build_or_error(record)).collect()
    }

    pub fn build_or_error(&self, record: &UnifiedStudentRecord) -> OutputRow {
        let feedback = aggregate_feedback(many(record, self.slots.feedback.as_deref()));
        match self.build(record, &feedback) {
            Ok(row) => row,
            Err(err) => {
                warn!(key = %record.key, %err, "emitting error row");
                error_row(record.key, &err.to_string())
            }
        }
    }

    pub fn build(
        &self,
        record: &UnifiedStudentRecord,
        feedback: &FeedbackByPeriod,
    ) -> Result<OutputRow, BuildError> {
        let slots = self.slots;
        let registration = single(record, slots.registration.as_deref());
        let enrollment = single(record, slots.enrollment.as_deref());
        let contacts = single(record, slots.contacts.as_deref());
        let attendance = single(record, slots.attendance.as_deref());
        let schedules: Vec<&Record> = many(record, slots.schedules.as_deref())
            .iter()
            .filter(|entry| entry.non_empty(&slots.withdraw_field).is_none())
            .collect();

        let secondary_name = field(enrollment, fields::FULL_NAME).and_then(parse_full_name);
        let last_name = first_non_empty([
            field(registration, fields::LAST_NAME),
            secondary_name.as_ref().map(|(last, _)| last.as_str()),
        ]);
        let first_name = first_non_empty([
            field(registration, fields::FIRST_NAME),
            secondary_name.as_ref().map(|(_, first)| first.as_str()),
        ]);
        if last_name.is_none() && first_name.is_none() {
            return Err(BuildError::MissingName);
        }
        let last_name = last_name.unwrap_or_default();
        let first_name = first_name.unwrap_or_default();

        let entry_date = field(enrollment, fields::ENTRY_DATE)
            .and_then(calendar::parse_date)
            .or_else(|| {
                schedules
                    .iter()
                    .filter_map(|entry| {
                        entry.get(fields::ENTRY_DATE).and_then(calendar::parse_date)
                    })
                    .max()
            });

        let placement_days = field(registration, fields::PLACEMENT_DAYS)
            .and_then(parse_day_count)
            .or_else(|| self.backup.placement_days(record.key));
        if let Some(days) = placement_days {
            if days > MAX_PLACEMENT_DAYS {
                return Err(BuildError::PlacementDaysOutOfRange(days));
            }
        }

        let dates = calendar::derive_dates(
            entry_date,
            placement_days,
            self.early_notice_workdays,
            self.holidays,
            self.today,
        );

        let mut cells = vec![String::new(); layout::WIDTH];
        let mut put = |column: usize, value: Option<&str>| {
            cells[column] = value.unwrap_or_default().to_string();
        };

        put(layout::TIMESTAMP, field(registration, fields::TIMESTAMP));
        put(layout::LAST_NAME, Some(last_name));
        put(layout::FIRST_NAME, Some(first_name));
        put(layout::STUDENT_KEY, Some(record.key.to_string().as_str()));
        put(
            layout::GRADE,
            first_non_empty([field(registration, fields::GRADE), field(enrollment, fields::GRADE)]),
        );

        let by_period = schedule_by_period(&schedules);
        for number in 1..=layout::PERIOD_COUNT {
            let entry = by_period.get(&number).copied();
            let notes = feedback.get(&number);

            put(layout::period_cell(number, period::COURSE), field(entry, fields::COURSE));
            put(
                layout::period_cell(number, period::TEACHER),
                first_non_empty([field(entry, fields::TEACHER), notes.map(|n| n.teacher.as_str())]),
            );
            put(
                layout::period_cell(number, period::CURRENT_GRADE),
                notes.map(|n| n.current_grade.as_str()),
            );
            put(
                layout::period_cell(number, period::MISSING_WORK),
                notes.map(|n| n.missing_work.as_str()),
            );
            put(layout::period_cell(number, period::COMMENTS), notes.map(|n| n.comments.as_str()));
            let submitted = notes.and_then(|n| n.submitted).map(|stamp| format_date(stamp.date()));
            put(layout::period_cell(number, period::FEEDBACK_DATE), submitted.as_deref());
        }

        let factors = first_non_empty([
            field(registration, fields::EDUCATIONAL_FACTORS),
            field(enrollment, fields::EDUCATIONAL_FACTORS),
        ]);
        let factors_text = factors.unwrap_or_default();
        put(layout::EDUCATIONAL_FACTORS, factors);
        for (column, marker) in [
            (layout::HAS_504, &self.markers.section_504),
            (layout::HAS_IEP, &self.markers.iep),
            (layout::IS_ESL, &self.markers.esl),
        ] {
            put(column, Some(flag(contains_marker(factors_text, marker)).as_str()));
        }
        put(layout::CASE_MANAGER, field(registration, fields::CASE_MANAGER));

        let date_cell = |date: Option<NaiveDate>| date.map(format_date);
        put(layout::ENTRY_DATE, date_cell(dates.entry).as_deref());
        put(layout::PLACEMENT_DAYS, placement_days.map(|days| days.to_string()).as_deref());
        put(layout::EARLY_NOTICE, date_cell(dates.early_notice).as_deref());
        put(layout::PROJECTED_EXIT, date_cell(dates.projected_exit).as_deref());
        put(layout::DAYS_LEFT, dates.days_left.map(|days| days.to_string()).as_deref());
        put(layout::DAYS_ATTENDED, field(attendance, fields::DAYS_ATTENDED));
        put(layout::ABSENCES, field(attendance, fields::ABSENCES));
        put(layout::PLACEMENT_REASON, field(registration, fields::PLACEMENT_REASON));

        for (column, name) in [
            (layout::PARENT_NAME, fields::PARENT_NAME),
            (layout::PARENT_EMAIL, fields::PARENT_EMAIL),
            (layout::PARENT_PHONE, fields::PARENT_PHONE),
            (layout::COUNSELOR, fields::COUNSELOR),
        ] {
            put(column, first_non_empty([field(contacts, name), field(registration, name)]));
        }

        let (sort_last, sort_first) = match &secondary_name {
            Some((last, first)) => (last.clone(), first.clone()),
            None => (last_name.to_string(), first_name.to_string()),
        };

        Ok(OutputRow {
            key: record.key,
            cells,
            sort_last,
            sort_first,
            error: None,
        })
    }
}

fn schedule_by_period<'r>(schedules: &[&'r Record]) -> BTreeMap<usize, &'r Record> {
    let mut chosen: BTreeMap<usize, (&'r Record, Option<NaiveDate>)> = BTreeMap::new();
    for &entry in schedules {
        let Some(number) = entry.get(fields::PERIOD).and_then(normalize_period) else {
            continue;
        };
        let entered = entry.get(fields::ENTRY_DATE).and_then(calendar::parse_date);
        let replace = match chosen.get(&number) {
            Some((_, current)) => entered >= *current,
            None => true,
        };
        if replace {
            chosen.insert(number, (entry, entered));
        }
    }
    chosen.into_iter().map(|(number, (entry, _))| (number, entry)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::models::Slot;

    struct FixedBackup(Option<u32>);

    impl BackupLookup for FixedBackup {
        fn placement_days(&self, _key: StudentKey) -> Option<u32> {
            self.0
        }
    }

    fn key(value: u64) -> StudentKey {
        StudentKey::new(value).expect("key")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 8).expect("date")
    }

    fn student(value: u64, slots: Vec<(&str, Slot)>) -> UnifiedStudentRecord {
        let mut record = UnifiedStudentRecord::new(key(value));
        for (name, slot) in slots {
            record.slots.insert(name.to_string(), slot);
        }
        record
    }

    fn registration(pairs: &[(&str, &str)]) -> (&'static str, Slot) {
        (catalog::REGISTRATION, Slot::Single(Record::from_pairs(pairs.iter().copied())))
    }

    fn enrollment(pairs: &[(&str, &str)]) -> (&'static str, Slot) {
        (catalog::ENROLLMENT, Slot::Single(Record::from_pairs(pairs.iter().copied())))
    }

    fn schedule_entry(period: &str, course: &str, entered: &str, withdrawn: &str) -> Record {
        Record::from_pairs([
            ("Period", period),
            ("Course", course),
            ("Entry Date", entered),
            ("Withdraw Date", withdrawn),
        ])
    }

    fn feedback_entry(period: &str, timestamp: &str, grade: &str) -> Record {
        Record::from_pairs([
            ("Period", period),
            ("Timestamp", timestamp),
            ("Current Grade", grade),
        ])
    }

    fn build(record: &UnifiedStudentRecord, backup: Option<u32>) -> OutputRow {
        let holidays = HolidayCalendar::default();
        let markers = FlagMarkers::default();
        let backup = FixedBackup(backup);
        let slots = SourceSlots::from_config(&SyncConfig::default());
        RowBuilder::new(&slots, &holidays, &backup, &markers, 5, today()).build_or_error(record)
    }

    #[test]
    fn period_labels_normalize() {
        assert_eq!(normalize_period("Period 3"), Some(3));
        assert_eq!(normalize_period("P8"), Some(8));
        assert_eq!(normalize_period("1st"), Some(1));
        assert_eq!(normalize_period("9"), None);
        assert_eq!(normalize_period("Advisory"), None);
    }

    #[test]
    fn full_names_parse_with_and_without_comma() {
        assert_eq!(parse_full_name("Doe, Jane (1234567)"), Some(("Doe".into(), "Jane".into())));
        assert_eq!(parse_full_name("Mary Ann Roe"), Some(("Roe".into(), "Mary Ann".into())));
        assert_eq!(parse_full_name(" (123456) "), None);
    }

    #[test]
    fn feedback_keeps_latest_submission_per_period() {
        let entries = vec![
            feedback_entry("P2", "3/4/2024 09:00:00", "C"),
            feedback_entry("2", "3/6/2024 09:00:00", "B"),
            feedback_entry("Period 2", "3/5/2024 09:00:00", "D"),
            Record::from_pairs([("Period", "lunch"), ("Current Grade", "A")]),
        ];
        let feedback = aggregate_feedback(&entries);
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[&2].current_grade, "B");
        assert_eq!(feedback[&2].submissions, 3);
    }

    #[test]
    fn names_fall_back_to_secondary_full_name() {
        let record = student(
            123456,
            vec![
                registration(&[("Grade", "10")]),
                (
                    catalog::ENROLLMENT,
                    Slot::Single(Record::from_pairs([("Student Name", "Doe, Jane (123456)")])),
                ),
            ],
        );
        let row = build(&record, None);
        assert!(!row.is_error());
        assert_eq!(row.cells[layout::LAST_NAME], "Doe");
        assert_eq!(row.cells[layout::FIRST_NAME], "Jane");
        assert_eq!(row.cells[layout::GRADE], "10");
        assert_eq!((row.sort_last.as_str(), row.sort_first.as_str()), ("Doe", "Jane"));
    }

    #[test]
    fn entry_date_falls_back_to_latest_active_schedule() {
        let schedules = vec![
            schedule_entry("1", "Algebra", "3/1/2024", ""),
            schedule_entry("2", "Biology", "3/4/2024", ""),
            schedule_entry("2", "Chemistry", "3/8/2024", "3/8/2024"),
        ];
        let record = student(
            123456,
            vec![
                registration(&[
                    ("Student Last Name", "Doe"),
                    ("Student First Name", "Jane"),
                    ("Placement Days", "10"),
                ]),
                (catalog::SCHEDULES, Slot::Many(schedules)),
            ],
        );
        let row = build(&record, None);

        assert_eq!(row.cells[layout::ENTRY_DATE], "2024-03-04");
        assert_eq!(row.cells[layout::period_cell(1, period::COURSE)], "Algebra");
        assert_eq!(row.cells[layout::period_cell(2, period::COURSE)], "Biology");
        assert_eq!(row.cells[layout::PLACEMENT_DAYS], "10");
        assert_eq!(row.cells[layout::EARLY_NOTICE], "2024-03-11");
        assert_eq!(row.cells[layout::PROJECTED_EXIT], "2024-03-18");
        assert_eq!(row.cells[layout::DAYS_LEFT], "5");
    }

    #[test]
    fn placement_days_fall_back_to_backup_table() {
        let record = student(
            123456,
            vec![
                registration(&[("Student Last Name", "Doe"), ("Placement Days", "n/a")]),
                enrollment(&[("Entry Date", "2024-03-04")]),
            ],
        );
        assert_eq!(build(&record, Some(3)).cells[layout::PLACEMENT_DAYS], "3");

        let without_backup = build(&record, None);
        assert_eq!(without_backup.cells[layout::PLACEMENT_DAYS], "");
        assert_eq!(without_backup.cells[layout::PROJECTED_EXIT], "");
        assert_eq!(without_backup.cells[layout::ENTRY_DATE], "2024-03-04");
    }

    #[test]
    fn invalid_entry_date_leaves_derived_fields_empty() {
        let record = student(
            123456,
            vec![
                registration(&[("Student Last Name", "Doe"), ("Placement Days", "10")]),
                enrollment(&[("Entry Date", "someday")]),
            ],
        );
        let row = build(&record, None);
        assert!(!row.is_error());
        assert_eq!(row.cells[layout::ENTRY_DATE], "");
        assert_eq!(row.cells[layout::DAYS_LEFT], "");
        assert_eq!(row.cells[layout::PLACEMENT_DAYS], "10");
    }

    #[test]
    fn flags_follow_resolved_educational_factors() {
        let record = student(
            123456,
            vec![
                registration(&[("Student Last Name", "Doe")]),
                (
                    catalog::ENROLLMENT,
                    Slot::Single(Record::from_pairs([(
                        "Educational Factors",
                        "504 plan; esl support",
                    )])),
                ),
            ],
        );
        let row = build(&record, None);
        assert_eq!(row.cells[layout::EDUCATIONAL_FACTORS], "504 plan; esl support");
        assert_eq!(row.cells[layout::HAS_504], "TRUE");
        assert_eq!(row.cells[layout::IS_ESL], "TRUE");
        assert_eq!(row.cells[layout::HAS_IEP], "FALSE");
    }

    #[test]
    fn period_columns_merge_schedule_and_feedback() {
        let record = student(
            123456,
            vec![
                registration(&[("Student Last Name", "Doe")]),
                (
                    catalog::SCHEDULES,
                    Slot::Many(vec![schedule_entry("3", "History", "", "")]),
                ),
                (
                    catalog::FEEDBACK,
                    Slot::Many(vec![Record::from_pairs([
                        ("Period", "3rd"),
                        ("Teacher", "Ms. Park"),
                        ("Timestamp", "3/7/2024 14:00:00"),
                        ("Missing Assignments", "2"),
                        ("Comments", "Needs to finish essay"),
                    ])]),
                ),
            ],
        );
        let row = build(&record, None);
        assert_eq!(row.cells[layout::period_cell(3, period::COURSE)], "History");
        assert_eq!(row.cells[layout::period_cell(3, period::TEACHER)], "Ms. Park");
        assert_eq!(row.cells[layout::period_cell(3, period::MISSING_WORK)], "2");
        assert_eq!(row.cells[layout::period_cell(3, period::FEEDBACK_DATE)], "2024-03-07");
        assert_eq!(row.cells[layout::period_cell(4, period::COURSE)], "");
    }

    #[test]
    fn build_errors_become_full_width_error_rows() {
        let nameless = student(222222, vec![registration(&[("Grade", "9")])]);
        let row = build(&nameless, None);
        assert!(row.is_error());
        assert_eq!(row.cells.len(), layout::WIDTH);
        assert_eq!(row.cells[layout::TIMESTAMP], ERROR_MARKER);
        assert_eq!(row.cells[layout::STUDENT_KEY], "222222");

        let too_long = student(
            333333,
            vec![registration(&[("Student Last Name", "Roe"), ("Placement Days", "400")])],
        );
        let row = build(&too_long, None);
        assert_eq!(row.error, Some(BuildError::PlacementDaysOutOfRange(400).to_string()));
    }

    #[test]
    fn key_column_round_trips() {
        let record = student(1234567, vec![registration(&[("Student Last Name", "Doe")])]);
        let row = build(&record, None);
        assert_eq!(row.cells.len(), layout::WIDTH);
        assert_eq!(StudentKey::extract(&row.cells[layout::STUDENT_KEY]), Some(record.key));
    }
}
