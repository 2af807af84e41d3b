use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::calendar::{parse_timestamp, HolidayCalendar};
use crate::catalog;
use crate::error::SyncError;
use crate::models::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    Single,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Roster,
    Schedule,
    Withdrawal,
    Auxiliary,
}

/// Which part of the published row a source fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    Registration,
    Enrollment,
    Contacts,
    Attendance,
    Feedback,
}

impl Feed {
    const ROSTER: [Feed; 2] = [Feed::Registration, Feed::Enrollment];

    fn multiplicity(self) -> Multiplicity {
        match self {
            Feed::Feedback => Multiplicity::Many,
            _ => Multiplicity::Single,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConflictRule {
    /// Keep the record with the latest date in `field`; ties go to the later row.
    LatestBy { field: String },
}

impl ConflictRule {
    pub fn prefers(&self, candidate: &Record, current: &Record) -> bool {
        match self {
            Self::LatestBy { field } => {
                let stamp = |record: &Record| record.get(field).and_then(parse_timestamp);
                stamp(candidate) >= stamp(current)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum InclusionRule {
    /// Drop the row when `field` holds anything but whitespace.
    ExcludeIfPresent { field: String },
}

impl InclusionRule {
    pub fn admits(&self, record: &Record) -> bool {
        match self {
            Self::ExcludeIfPresent { field } => record.non_empty(field).is_none(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::ExcludeIfPresent { field } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub file: String,
    pub key_column: String,
    pub multiplicity: Multiplicity,
    pub role: SourceRole,
    #[serde(default)]
    pub conflict: Option<ConflictRule>,
    #[serde(default)]
    pub include: Option<InclusionRule>,
    #[serde(default)]
    pub feeds: Option<Feed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub holidays: Vec<String>,
    pub early_notice_workdays: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            holidays: Vec::new(),
            early_notice_workdays: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagMarkers {
    pub section_504: String,
    pub iep: String,
    pub esl: String,
}

impl Default for FlagMarkers {
    fn default() -> Self {
        Self {
            section_504: "504".to_string(),
            iep: "IEP".to_string(),
            esl: "ESL".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConfig {
    Csv { path: PathBuf },
    /// Connection string comes from `DATABASE_URL`.
    Postgres,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::Csv {
            path: PathBuf::from("published.csv"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub sources_dir: PathBuf,
    pub sources: Vec<SourceSpec>,
    pub backup_source: SourceSpec,
    pub calendar: CalendarConfig,
    pub markers: FlagMarkers,
    pub target: TargetConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_dir: PathBuf::from("sources"),
            sources: catalog::standard_sources(),
            backup_source: catalog::backup_source(),
            calendar: CalendarConfig::default(),
            markers: FlagMarkers::default(),
            target: TargetConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    SyncError::Config(format!("cannot read {}: {err}", path.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, SyncError> {
        toml::from_str(text).map_err(|err| SyncError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let mut names = BTreeSet::new();
        for source in self.sources.iter().chain(std::iter::once(&self.backup_source)) {
            if !names.insert(source.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate source name {:?}", source.name)));
            }
            if source.key_column.trim().is_empty() {
                return Err(SyncError::Config(format!(
                    "source {:?} has no key column",
                    source.name
                )));
            }
        }

        if !self.sources.iter().any(|source| source.role == SourceRole::Roster) {
            return Err(SyncError::Config("at least one roster source is required".to_string()));
        }
        let schedules = self
            .sources
            .iter()
            .filter(|source| source.role == SourceRole::Schedule)
            .count();
        if schedules != 1 {
            return Err(SyncError::Config(format!(
                "exactly one schedule source is required, found {schedules}"
            )));
        }

        let mut claimed = Vec::new();
        for source in &self.sources {
            let Some(feed) = source.feeds else {
                continue;
            };
            if claimed.contains(&feed) {
                return Err(SyncError::Config(format!("more than one source feeds {feed:?}")));
            }
            if source.multiplicity != feed.multiplicity() {
                return Err(SyncError::Config(format!(
                    "source {:?} feeds {feed:?} and must be {:?}",
                    source.name,
                    feed.multiplicity()
                )));
            }
            claimed.push(feed);
        }

        HolidayCalendar::from_canonical(&self.calendar.holidays)?;
        Ok(())
    }

    pub fn holiday_calendar(&self) -> Result<HolidayCalendar, SyncError> {
        HolidayCalendar::from_canonical(&self.calendar.holidays)
    }

    pub fn sources_with_role(&self, role: SourceRole) -> impl Iterator<Item = &SourceSpec> {
        self.sources.iter().filter(move |source| source.role == role)
    }

    pub fn schedule_source(&self) -> Option<&SourceSpec> {
        self.sources_with_role(SourceRole::Schedule).next()
    }

    pub fn withdraw_field(&self) -> &str {
        self.schedule_source()
            .and_then(|source| source.include.as_ref())
            .map_or(catalog::fields::WITHDRAW_DATE, InclusionRule::field)
    }

    /// The source declared with `feeds`, otherwise an untagged roster source:
    /// unclaimed roster feeds take untagged roster sources in declared order.
    pub fn feed_source(&self, feed: Feed) -> Option<&SourceSpec> {
        if let Some(source) = self.sources.iter().find(|source| source.feeds == Some(feed)) {
            return Some(source);
        }

        let position = Feed::ROSTER
            .iter()
            .filter(|roster| !self.sources.iter().any(|source| source.feeds == Some(**roster)))
            .position(|roster| *roster == feed)?;
        self.sources_with_role(SourceRole::Roster)
            .filter(|source| source.feeds.is_none())
            .nth(position)
    }
}
