//! Column order of the published table.
//!
//! This order is a versioned contract with everything that reads the
//! published table. Changing it means bumping `LAYOUT_VERSION` and updating
//! the row builder's cell assignments in `rows.rs`.

use std::ops::Range;

pub const LAYOUT_VERSION: u32 = 3;

pub const TIMESTAMP: usize = 0;
pub const LAST_NAME: usize = 1;
pub const FIRST_NAME: usize = 2;
pub const STUDENT_KEY: usize = 3;
pub const GRADE: usize = 4;

pub const PERIOD_BASE: usize = 5;
pub const PERIOD_COUNT: usize = 8;
pub const PERIOD_WIDTH: usize = 6;

pub mod period {
    pub const COURSE: usize = 0;
    pub const TEACHER: usize = 1;
    pub const CURRENT_GRADE: usize = 2;
    pub const MISSING_WORK: usize = 3;
    pub const COMMENTS: usize = 4;
    pub const FEEDBACK_DATE: usize = 5;
}

const SPECIAL_ED_BASE: usize = PERIOD_BASE + PERIOD_COUNT * PERIOD_WIDTH;
pub const EDUCATIONAL_FACTORS: usize = SPECIAL_ED_BASE;
pub const HAS_504: usize = SPECIAL_ED_BASE + 1;
pub const HAS_IEP: usize = SPECIAL_ED_BASE + 2;
pub const IS_ESL: usize = SPECIAL_ED_BASE + 3;
pub const CASE_MANAGER: usize = SPECIAL_ED_BASE + 4;

const ADMIN_BASE: usize = SPECIAL_ED_BASE + 5;
pub const ENTRY_DATE: usize = ADMIN_BASE;
pub const PLACEMENT_DAYS: usize = ADMIN_BASE + 1;
pub const EARLY_NOTICE: usize = ADMIN_BASE + 2;
pub const PROJECTED_EXIT: usize = ADMIN_BASE + 3;
pub const DAYS_LEFT: usize = ADMIN_BASE + 4;
pub const DAYS_ATTENDED: usize = ADMIN_BASE + 5;
pub const ABSENCES: usize = ADMIN_BASE + 6;
pub const PLACEMENT_REASON: usize = ADMIN_BASE + 7;
pub const PARENT_NAME: usize = ADMIN_BASE + 8;
pub const PARENT_EMAIL: usize = ADMIN_BASE + 9;
pub const PARENT_PHONE: usize = ADMIN_BASE + 10;
pub const COUNSELOR: usize = ADMIN_BASE + 11;

/// Written by the document-merge job, never by the row builder.
pub const MERGED_DOC_URL: usize = ADMIN_BASE + 12;
pub const MERGE_STATUS: usize = ADMIN_BASE + 13;

pub const WIDTH: usize = MERGE_STATUS + 1;

/// Cells the row builder owns; updates carry everything else over.
pub const BUILDER_OWNED: Range<usize> = 0..MERGED_DOC_URL;

pub fn period_cell(period: usize, offset: usize) -> usize {
    debug_assert!((1..=PERIOD_COUNT).contains(&period));
    PERIOD_BASE + (period - 1) * PERIOD_WIDTH + offset
}

pub fn headers() -> Vec<String> {
    let mut headers = vec![
        "Timestamp".to_string(),
        "Last Name".to_string(),
        "First Name".to_string(),
        "Student ID".to_string(),
        "Grade".to_string(),
    ];
    for period in 1..=PERIOD_COUNT {
        for label in [
            "Course",
            "Teacher",
            "Current Grade",
            "Missing Work",
            "Comments",
            "Feedback Date",
        ] {
            headers.push(format!("P{period} {label}"));
        }
    }
    headers.extend(
        [
            "Educational Factors",
            "504",
            "IEP",
            "ESL",
            "Case Manager",
            "Entry Date",
            "Placement Days",
            "Early Notice",
            "Projected Exit",
            "Days Left",
            "Days Attended",
            "Absences",
            "Placement Reason",
            "Parent Name",
            "Parent Email",
            "Parent Phone",
            "Counselor",
            "Merged Doc URL",
            "Merge Status",
        ]
        .map(str::to_string),
    );
    headers
}
