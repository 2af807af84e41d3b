use std::fmt::Write;

use crate::layout::LAYOUT_VERSION;
use crate::merge::SourceStats;
use crate::models::EligibilityDecision;
use crate::pipeline::RunReport;
use crate::upsert::PlanAction;

fn decision_label(decision: EligibilityDecision) -> &'static str {
    match decision {
        EligibilityDecision::Include => "included",
        EligibilityDecision::Reinstated => "reinstated",
        EligibilityDecision::ExcludeWithdrawn => "excluded (withdrawn)",
        EligibilityDecision::ExcludeOther => "excluded (no roster entry)",
    }
}

fn action_label(action: PlanAction) -> &'static str {
    match action {
        PlanAction::Update => "update",
        PlanAction::Insert => "insert",
        PlanAction::Preserve => "preserve",
    }
}

fn write_sources(output: &mut String, stats: &[SourceStats]) {
    let _ = writeln!(output, "## Sources");
    if stats.is_empty() {
        let _ = writeln!(output, "No sources configured.");
        return;
    }
    for source in stats {
        let _ = writeln!(
            output,
            "- {}: {} rows read, {} excluded by rule, {} without a key, {} students",
            source.source, source.rows_read, source.rows_excluded, source.keys_dropped, source.keys
        );
    }
}

pub fn build_report(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut output = String::new();

    let _ = writeln!(output, "# Student Sync Report");
    let _ = writeln!(
        output,
        "Run {} for {}, layout v{}{}",
        summary.run_id,
        summary.today,
        LAYOUT_VERSION,
        if summary.dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(output);
    write_sources(&mut output, &report.source_stats);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Eligibility");
    let _ = writeln!(output, "- included: {}", summary.included);
    let _ = writeln!(output, "- reinstated: {}", summary.reinstated);
    let _ = writeln!(output, "- excluded (withdrawn): {}", summary.excluded_withdrawn);
    let _ = writeln!(output, "- excluded (no roster entry): {}", summary.excluded_other);

    let reinstated: Vec<_> = report
        .decisions
        .iter()
        .filter(|(_, decision)| **decision == EligibilityDecision::Reinstated)
        .collect();
    if !reinstated.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "Reinstated after withdrawal:");
        for (key, decision) in reinstated {
            let _ = writeln!(output, "- {} ({})", key, decision_label(*decision));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Merge Plan");
    let _ = writeln!(
        output,
        "{} updated, {} inserted, {} preserved, {} rows untouched; {} rows written",
        summary.updated,
        summary.inserted,
        summary.preserved,
        summary.untouched,
        summary.rows_written
    );
    let changes: Vec<_> = report
        .plan
        .entries
        .iter()
        .filter(|entry| entry.action != PlanAction::Preserve)
        .collect();
    for entry in changes.iter().take(25) {
        match entry.position {
            Some(position) => {
                let _ = writeln!(
                    output,
                    "- {} {} at row {}",
                    action_label(entry.action),
                    entry.key,
                    position
                );
            }
            None => {
                let _ = writeln!(output, "- {} {}", action_label(entry.action), entry.key);
            }
        }
    }
    if changes.len() > 25 {
        let _ = writeln!(output, "- ... and {} more", changes.len() - 25);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Error Rows");
    if report.errors.is_empty() {
        let _ = writeln!(output, "No build errors.");
    } else {
        for (key, reason) in &report.errors {
            let _ = writeln!(output, "- {key}: {reason}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Duplicate Keys");
    if summary.duplicate_keys.is_empty() {
        let _ = writeln!(output, "No duplicate student keys in the published table.");
    } else {
        for duplicate in &summary.duplicate_keys {
            let positions: Vec<String> =
                duplicate.positions.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(output, "- {} at rows {}", duplicate.key, positions.join(", "));
        }
    }

    output
}
