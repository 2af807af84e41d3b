//! Business-day arithmetic for placement dates.
//!
//! Every function here is pure: the holiday calendar and "today" are passed
//! in, never read from global state. One counting rule applies everywhere:
//! the start day never counts toward a workday total.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Weekday};

use crate::error::SyncError;
use crate::models::DerivedDates;

pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    days: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn from_canonical(days: &[String]) -> Result<Self, SyncError> {
        let mut parsed = BTreeSet::new();
        for day in days {
            let date = NaiveDate::parse_from_str(day.trim(), CANONICAL_DATE_FORMAT)
                .map_err(|err| SyncError::Config(format!("invalid holiday {day:?}: {err}")))?;
            parsed.insert(date);
        }
        Ok(Self { days: parsed })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_holiday(date: NaiveDate, holidays: &HolidayCalendar) -> bool {
    holidays.contains(date)
}

pub fn is_business_day(date: NaiveDate, holidays: &HolidayCalendar) -> bool {
    !is_weekend(date) && !is_holiday(date, holidays)
}

/// Advances from `start` until `n` business days have been counted and
/// returns the landing day. `start` itself is never counted, so
/// `add_workdays(friday, 1)` is the following Monday.
///
/// With `n == 0` the result is `start` rolled forward to the first business
/// day on or after it, so the result is always a business day. `None` only
/// when the walk runs off the end of the representable calendar.
pub fn add_workdays(start: NaiveDate, n: u32, holidays: &HolidayCalendar) -> Option<NaiveDate> {
    let mut current = start;

    if n == 0 {
        while !is_business_day(current, holidays) {
            current = current.succ_opt()?;
        }
        return Some(current);
    }

    let mut counted = 0;
    while counted < n {
        current = current.succ_opt()?;
        if is_business_day(current, holidays) {
            counted += 1;
        }
    }
    Some(current)
}

pub fn projected_exit(
    entry: NaiveDate,
    placement_days: u32,
    holidays: &HolidayCalendar,
) -> Option<NaiveDate> {
    add_workdays(entry, placement_days, holidays)
}

pub fn workdays_between(from: NaiveDate, to: NaiveDate, holidays: &HolidayCalendar) -> u32 {
    from.iter_days()
        .skip(1)
        .take_while(|day| *day < to)
        .filter(|day| is_business_day(*day, holidays))
        .count() as u32
}

pub fn days_left(
    entry: NaiveDate,
    placement_days: u32,
    holidays: &HolidayCalendar,
    today: NaiveDate,
) -> Option<u32> {
    let exit = projected_exit(entry, placement_days, holidays)?;
    if today >= exit {
        return Some(0);
    }
    Some(workdays_between(today, exit, holidays))
}

pub fn derive_dates(
    entry: Option<NaiveDate>,
    placement_days: Option<u32>,
    early_notice_workdays: u32,
    holidays: &HolidayCalendar,
    today: NaiveDate,
) -> DerivedDates {
    let Some(entry) = entry else {
        return DerivedDates::default();
    };

    let early_notice = add_workdays(entry, early_notice_workdays, holidays);
    let (projected_exit, days_left) = match placement_days {
        Some(days) => (
            projected_exit(entry, days, holidays),
            days_left(entry, days, holidays, today),
        ),
        None => (None, None),
    };

    DerivedDates {
        entry: Some(entry),
        early_notice,
        projected_exit,
        days_left,
    }
}

fn parse_plain_date(trimmed: &str) -> Option<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            // `%Y` happily reads "3/1/24" as year 24.
            if date.year() >= 1900 {
                return Some(date);
            }
        }
    }
    NaiveDate::parse_from_str(trimmed, "%m/%d/%y").ok()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_plain_date(trimmed).or_else(|| parse_timestamp(trimmed).map(|stamp| stamp.date()))
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for format in TIMESTAMP_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            if stamp.year() >= 1900 {
                return Some(stamp);
            }
        }
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(stamp.naive_local());
    }

    parse_plain_date(trimmed).and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(CANONICAL_DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn calendar(days: &[&str]) -> HolidayCalendar {
        let owned: Vec<String> = days.iter().map(|day| day.to_string()).collect();
        HolidayCalendar::from_canonical(&owned).expect("holidays")
    }

    #[test]
    fn weekends_are_saturday_and_sunday() {
        // 2024-03-02 is a Saturday.
        assert!(is_weekend(date(2024, 3, 2)));
        assert!(is_weekend(date(2024, 3, 3)));
        assert!(!is_weekend(date(2024, 3, 4)));
    }

    #[test]
    fn holiday_lookup_uses_canonical_dates() {
        let holidays = calendar(&["2024-01-15"]);
        assert!(is_holiday(date(2024, 1, 15), &holidays));
        assert!(!is_holiday(date(2024, 1, 16), &holidays));
        assert!(HolidayCalendar::from_canonical(&["1/15/2024".to_string()]).is_err());
    }

    #[test]
    fn start_day_never_counts() {
        let holidays = HolidayCalendar::default();
        // Monday + 1 = Tuesday.
        assert_eq!(add_workdays(date(2024, 3, 4), 1, &holidays), Some(date(2024, 3, 5)));
        // Friday + 1 = Monday.
        assert_eq!(add_workdays(date(2024, 3, 8), 1, &holidays), Some(date(2024, 3, 11)));
        // Monday + 5 = next Monday.
        assert_eq!(add_workdays(date(2024, 3, 4), 5, &holidays), Some(date(2024, 3, 11)));
    }

    #[test]
    fn zero_workdays_rolls_to_business_day() {
        let holidays = HolidayCalendar::default();
        assert_eq!(add_workdays(date(2024, 3, 4), 0, &holidays), Some(date(2024, 3, 4)));
        assert_eq!(add_workdays(date(2024, 3, 2), 0, &holidays), Some(date(2024, 3, 4)));
    }

    #[test]
    fn holidays_are_skipped() {
        let holidays = calendar(&["2024-03-05", "2024-03-06"]);
        assert_eq!(add_workdays(date(2024, 3, 4), 1, &holidays), Some(date(2024, 3, 7)));
    }

    #[test]
    fn landing_day_is_always_a_business_day_with_exact_count() {
        let holidays = calendar(&["2024-11-28", "2024-11-29", "2024-12-23", "2024-12-24"]);
        let mut start = date(2024, 11, 20);
        while start < date(2024, 12, 31) {
            for n in 0..25 {
                let landed = add_workdays(start, n, &holidays).expect("in range");
                assert!(is_business_day(landed, &holidays), "{start} + {n} -> {landed}");
                if n > 0 {
                    // Crossed days: strictly between plus the landing day.
                    assert_eq!(workdays_between(start, landed, &holidays) + 1, n);
                }
            }
            start = start.succ_opt().expect("next day");
        }
    }

    #[test]
    fn days_left_counts_strictly_between() {
        let holidays = HolidayCalendar::default();
        let entry = date(2024, 3, 4);
        // Exit is Monday 2024-03-18.
        assert_eq!(projected_exit(entry, 10, &holidays), Some(date(2024, 3, 18)));
        // Strictly between Friday 3/8 and Monday 3/18: 3/11..3/15.
        assert_eq!(days_left(entry, 10, &holidays, date(2024, 3, 8)), Some(5));
        assert_eq!(days_left(entry, 10, &holidays, date(2024, 3, 18)), Some(0));
        assert_eq!(days_left(entry, 10, &holidays, date(2024, 4, 1)), Some(0));
    }

    #[test]
    fn days_left_is_monotonic_and_hits_zero_at_exit() {
        let holidays = calendar(&["2024-03-13"]);
        let entry = date(2024, 3, 1);
        let exit = projected_exit(entry, 15, &holidays).expect("exit");
        let mut previous = u32::MAX;
        let mut today = date(2024, 2, 20);
        while today <= exit + chrono::Duration::days(5) {
            let left = days_left(entry, 15, &holidays, today).expect("days left");
            assert!(left <= previous);
            if today >= exit {
                assert_eq!(left, 0);
            }
            previous = left;
            today = today.succ_opt().expect("next day");
        }
    }

    #[test]
    fn derive_dates_leaves_fields_empty_without_inputs() {
        let holidays = HolidayCalendar::default();
        let today = date(2024, 3, 4);
        assert_eq!(derive_dates(None, Some(10), 5, &holidays, today), DerivedDates::default());

        let derived = derive_dates(Some(date(2024, 3, 4)), None, 5, &holidays, today);
        assert_eq!(derived.early_notice, Some(date(2024, 3, 11)));
        assert_eq!(derived.projected_exit, None);
        assert_eq!(derived.days_left, None);
    }

    #[test]
    fn parses_sheet_style_dates() {
        assert_eq!(parse_date("2024-03-01"), Some(date(2024, 3, 1)));
        assert_eq!(parse_date("3/1/2024"), Some(date(2024, 3, 1)));
        assert_eq!(parse_date("3/1/24"), Some(date(2024, 3, 1)));
        assert_eq!(parse_date("3/1/2024 10:15:00"), Some(date(2024, 3, 1)));
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn timestamps_order_within_a_day() {
        let morning = parse_timestamp("3/1/2024 08:00:00").expect("morning");
        let noon = parse_timestamp("2024-03-01 12:00").expect("noon");
        let midnight = parse_timestamp("3/1/2024").expect("midnight");
        assert!(midnight < morning && morning < noon);
        assert!(parse_timestamp("2024-03-01T12:00:00Z").is_some());
    }
}
