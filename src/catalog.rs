use crate::config::{ConflictRule, Feed, InclusionRule, Multiplicity, SourceRole, SourceSpec};

pub const REGISTRATION: &str = "registration";
pub const REGISTRATION_BACKUP: &str = "registration_backup";
pub const ENROLLMENT: &str = "enrollment";
pub const SCHEDULES: &str = "schedules";
pub const CONTACTS: &str = "contacts";
pub const ATTENDANCE: &str = "attendance";
pub const FEEDBACK: &str = "feedback";
pub const WITHDRAWALS: &str = "withdrawals";
pub const DISTRICT_WITHDRAWALS: &str = "district_withdrawals";

pub mod fields {
    pub const STUDENT_ID: &str = "Student ID";
    pub const TIMESTAMP: &str = "Timestamp";

    pub const LAST_NAME: &str = "Student Last Name";
    pub const FIRST_NAME: &str = "Student First Name";
    pub const FULL_NAME: &str = "Student Name";
    pub const GRADE: &str = "Grade";
    pub const PLACEMENT_DAYS: &str = "Placement Days";
    pub const PLACEMENT_REASON: &str = "Placement Reason";
    pub const EDUCATIONAL_FACTORS: &str = "Educational Factors";
    pub const CASE_MANAGER: &str = "Case Manager";

    pub const ENTRY_DATE: &str = "Entry Date";
    pub const WITHDRAW_DATE: &str = "Withdraw Date";
    pub const PERIOD: &str = "Period";
    pub const COURSE: &str = "Course";
    pub const TEACHER: &str = "Teacher";

    pub const CURRENT_GRADE: &str = "Current Grade";
    pub const MISSING_WORK: &str = "Missing Assignments";
    pub const COMMENTS: &str = "Comments";

    pub const PARENT_NAME: &str = "Parent Name";
    pub const PARENT_EMAIL: &str = "Parent Email";
    pub const PARENT_PHONE: &str = "Parent Phone";
    pub const COUNSELOR: &str = "Counselor";

    pub const DAYS_ATTENDED: &str = "Days Attended";
    pub const ABSENCES: &str = "Absences";
}

fn spec(name: &str, multiplicity: Multiplicity, role: SourceRole) -> SourceSpec {
    SourceSpec {
        name: name.to_string(),
        file: format!("{name}.csv"),
        key_column: fields::STUDENT_ID.to_string(),
        multiplicity,
        role,
        conflict: None,
        include: None,
        feeds: None,
    }
}

fn fed(feed: Feed, spec: SourceSpec) -> SourceSpec {
    SourceSpec {
        feeds: Some(feed),
        ..spec
    }
}

fn latest_by(field: &str) -> Option<ConflictRule> {
    Some(ConflictRule::LatestBy {
        field: field.to_string(),
    })
}

pub fn standard_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec {
            conflict: latest_by(fields::TIMESTAMP),
            feeds: Some(Feed::Registration),
            ..spec(REGISTRATION, Multiplicity::Single, SourceRole::Roster)
        },
        SourceSpec {
            key_column: fields::FULL_NAME.to_string(),
            conflict: latest_by(fields::ENTRY_DATE),
            feeds: Some(Feed::Enrollment),
            ..spec(ENROLLMENT, Multiplicity::Single, SourceRole::Roster)
        },
        SourceSpec {
            include: Some(InclusionRule::ExcludeIfPresent {
                field: fields::WITHDRAW_DATE.to_string(),
            }),
            ..spec(SCHEDULES, Multiplicity::Many, SourceRole::Schedule)
        },
        fed(Feed::Contacts, spec(CONTACTS, Multiplicity::Single, SourceRole::Auxiliary)),
        fed(Feed::Attendance, spec(ATTENDANCE, Multiplicity::Single, SourceRole::Auxiliary)),
        fed(Feed::Feedback, spec(FEEDBACK, Multiplicity::Many, SourceRole::Auxiliary)),
        spec(WITHDRAWALS, Multiplicity::Single, SourceRole::Withdrawal),
        spec(DISTRICT_WITHDRAWALS, Multiplicity::Single, SourceRole::Withdrawal),
    ]
}

pub fn backup_source() -> SourceSpec {
    SourceSpec {
        conflict: latest_by(fields::TIMESTAMP),
        ..spec(REGISTRATION_BACKUP, Multiplicity::Single, SourceRole::Auxiliary)
    }
}
