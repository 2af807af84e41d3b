use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

/// Canonical numeric student identifier shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StudentKey(u64);

impl StudentKey {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Pulls a key out of free-form text such as `"Doe, Jane (1234567)"`,
    /// `"S-123456"` or a bare `"42"`.
    ///
    /// The first maximal run of 6 or 7 digits wins. Otherwise the whole
    /// trimmed value must parse as a number (integral floats like
    /// `"123456.0"` are accepted, as spreadsheet exports produce them).
    pub fn extract(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(run) = trimmed
            .split(|c: char| !c.is_ascii_digit())
            .find(|run| (6..=7).contains(&run.len()))
        {
            return run.parse().ok().and_then(Self::new);
        }

        if let Ok(value) = trimmed.parse::<u64>() {
            return Self::new(value);
        }

        match trimmed.parse::<f64>() {
            Ok(value)
                if value.is_finite() && value.fract() == 0.0 && value >= 1.0 && value < 1e15 =>
            {
                Self::new(value as u64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for StudentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One source row, field order preserved from the header. A `None` value is a
/// null placeholder contributed by a join, distinct from an empty cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Option<String>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (name, value) in pairs {
            record.set(name, Some(value.into()));
        }
        record
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|value| !value.is_empty())
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(field, _)| field == name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn merge_from(&mut self, other: &Record) {
        for (name, value) in &other.fields {
            self.set(name.clone(), value.clone());
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(field, _)| field.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Single(Record),
    Many(Vec<Record>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedStudentRecord {
    pub key: StudentKey,
    pub slots: BTreeMap<String, Slot>,
}

impl UnifiedStudentRecord {
    pub fn new(key: StudentKey) -> Self {
        Self {
            key,
            slots: BTreeMap::new(),
        }
    }

    pub fn has_slot(&self, source: &str) -> bool {
        self.slots.contains_key(source)
    }

    pub fn single(&self, source: &str) -> Option<&Record> {
        match self.slots.get(source)? {
            Slot::Single(record) => Some(record),
            Slot::Many(records) => records.last(),
        }
    }

    pub fn many(&self, source: &str) -> &[Record] {
        match self.slots.get(source) {
            Some(Slot::Many(records)) => records,
            Some(Slot::Single(record)) => std::slice::from_ref(record),
            None => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityDecision {
    Include,
    ExcludeWithdrawn,
    ExcludeOther,
    Reinstated,
}

impl EligibilityDecision {
    pub fn is_included(self) -> bool {
        matches!(self, Self::Include | Self::Reinstated)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedDates {
    pub entry: Option<NaiveDate>,
    pub early_notice: Option<NaiveDate>,
    pub projected_exit: Option<NaiveDate>,
    pub days_left: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub key: StudentKey,
    pub cells: Vec<String>,
    pub sort_last: String,
    pub sort_first: String,
    pub error: Option<String>,
}

impl OutputRow {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRow {
    pub position: usize,
    pub key: Option<StudentKey>,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub key: StudentKey,
    pub positions: Vec<usize>,
}
