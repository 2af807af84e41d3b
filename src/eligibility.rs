use std::collections::BTreeMap;

use tracing::info;

use crate::config::{SourceRole, SyncConfig};
use crate::models::{EligibilityDecision, StudentKey, UnifiedStudentRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityFilter {
    withdrawal_sources: Vec<String>,
    roster_sources: Vec<String>,
    schedule_source: String,
    withdraw_field: String,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: BTreeMap<StudentKey, UnifiedStudentRecord>,
    pub decisions: BTreeMap<StudentKey, EligibilityDecision>,
    pub removed: usize,
    pub reinstated: usize,
}

impl FilterOutcome {
    pub fn count(&self, decision: EligibilityDecision) -> usize {
        self.decisions.values().filter(|value| **value == decision).count()
    }
}

impl EligibilityFilter {
    pub fn new(
        withdrawal_sources: Vec<String>,
        roster_sources: Vec<String>,
        schedule_source: impl Into<String>,
        withdraw_field: impl Into<String>,
    ) -> Self {
        Self {
            withdrawal_sources,
            roster_sources,
            schedule_source: schedule_source.into(),
            withdraw_field: withdraw_field.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let names = |role| {
            config
                .sources_with_role(role)
                .map(|source| source.name.clone())
                .collect::<Vec<_>>()
        };
        Self::new(
            names(SourceRole::Withdrawal),
            names(SourceRole::Roster),
            config
                .schedule_source()
                .map(|source| source.name.clone())
                .unwrap_or_default(),
            config.withdraw_field(),
        )
    }

    pub fn has_active_schedule(&self, record: &UnifiedStudentRecord) -> bool {
        record
            .many(&self.schedule_source)
            .iter()
            .any(|entry| entry.non_empty(&self.withdraw_field).is_none())
    }

    pub fn decide(&self, record: &UnifiedStudentRecord) -> EligibilityDecision {
        let withdrawn = self
            .withdrawal_sources
            .iter()
            .any(|source| record.has_slot(source));

        let decision = if !withdrawn {
            EligibilityDecision::Include
        } else if self.has_active_schedule(record) {
            EligibilityDecision::Reinstated
        } else {
            EligibilityDecision::ExcludeWithdrawn
        };

        let rostered = self
            .roster_sources
            .iter()
            .any(|source| record.has_slot(source));
        if decision.is_included() && !rostered {
            return EligibilityDecision::ExcludeOther;
        }
        decision
    }

    pub fn apply(&self, records: BTreeMap<StudentKey, UnifiedStudentRecord>) -> FilterOutcome {
        let mut outcome = FilterOutcome {
            decisions: records
                .keys()
                .map(|key| (*key, EligibilityDecision::Include))
                .collect(),
            kept: records,
            ..FilterOutcome::default()
        };

        for source in &self.withdrawal_sources {
            let listed: Vec<StudentKey> = outcome
                .kept
                .iter()
                .filter(|(_, record)| record.has_slot(source))
                .map(|(key, _)| *key)
                .collect();

            let mut removed = 0;
            let mut reinstated = 0;
            for key in listed {
                let active = outcome
                    .kept
                    .get(&key)
                    .is_some_and(|record| self.has_active_schedule(record));
                if active {
                    reinstated += 1;
                    outcome.decisions.insert(key, EligibilityDecision::Reinstated);
                } else {
                    removed += 1;
                    outcome.kept.remove(&key);
                    outcome.decisions.insert(key, EligibilityDecision::ExcludeWithdrawn);
                }
            }

            info!(source = %source, removed, reinstated, "withdrawal pass");
            outcome.removed += removed;
            outcome.reinstated += reinstated;
        }

        let unrostered: Vec<StudentKey> = outcome
            .kept
            .iter()
            .filter(|(_, record)| !self.roster_sources.iter().any(|source| record.has_slot(source)))
            .map(|(key, _)| *key)
            .collect();
        for key in &unrostered {
            outcome.kept.remove(key);
            outcome.decisions.insert(*key, EligibilityDecision::ExcludeOther);
        }
        if !unrostered.is_empty() {
            info!(removed = unrostered.len(), "dropped students with no roster entry");
        }
        outcome.removed += unrostered.len();

        outcome
    }
}
