//! Run summary: aggregate figures and the final status table.

use chrono::{DateTime, Utc};
use console::Style;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::process::ExitCode;

use crate::exporter::MigrationResult;

/// Final state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionStatus {
    /// Every record was written (or would have been, in a dry run).
    Success,
    /// At least one record failed.
    PartialFailure,
}

impl CollectionStatus {
    /// Status of a collection result.
    pub fn of(result: &MigrationResult) -> Self {
        if result.success {
            Self::Success
        } else {
            Self::PartialFailure
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::PartialFailure => "PARTIAL_FAILURE",
        }
    }
}

/// Consolidated outcome of an orchestrated run.
///
/// Written rows are reported as one figure. A multi-row upsert only returns
/// an affected-row count, so inserts and updates are not split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the summary was produced.
    pub completed_at: DateTime<Utc>,
    /// Whether writes were suppressed.
    pub simulated: bool,
    /// Per-collection results, in the order they ran.
    pub results: Vec<MigrationResult>,
    /// Collection whose failure stopped the run.
    pub halted_at: Option<String>,
    /// Selected collections that never ran because of the halt.
    pub not_run: Vec<String>,
    /// Wall-clock duration of the whole run.
    pub duration_ms: u64,
}

impl MigrationReport {
    /// Sum of records processed.
    pub fn total_processed(&self) -> u64 {
        self.results.iter().map(|r| r.total_processed).sum()
    }

    /// Sum of rows written.
    pub fn total_written(&self) -> u64 {
        self.results.iter().map(|r| r.total_written).sum()
    }

    /// Sum of failed records.
    pub fn total_failed(&self) -> u64 {
        self.results.iter().map(|r| r.total_failed).sum()
    }

    /// Records processed per second over the whole run.
    pub fn throughput(&self) -> f64 {
        if self.duration_ms > 0 {
            self.total_processed() as f64 * 1000.0 / self.duration_ms as f64
        } else {
            0.0
        }
    }

    /// A dry run always succeeds; a real run succeeds when every collection did.
    pub fn is_success(&self) -> bool {
        self.simulated || (self.halted_at.is_none() && self.results.iter().all(|r| r.success))
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    /// Renders the summary table; `colors` toggles terminal styling.
    pub fn render(&self, colors: bool) -> String {
        let header = styled(Style::new().cyan().bold(), colors);
        let bold = styled(Style::new().bold(), colors);
        let ok = styled(Style::new().green(), colors);
        let bad = styled(Style::new().red().bold(), colors);

        let mut out = String::new();
        let title = if self.simulated {
            "Migration summary (dry run)"
        } else {
            "Migration summary"
        };
        let _ = writeln!(out, "{}", header.apply_to(title));
        let _ = writeln!(
            out,
            "{:<22} {:<16} {:>10} {:>10} {:>8} {:>9}",
            "Collection", "Status", "Processed", "Written", "Failed", "Duration"
        );
        let _ = writeln!(out, "{}", "-".repeat(80));

        for result in &self.results {
            let status = CollectionStatus::of(result);
            let style = match status {
                CollectionStatus::Success => &ok,
                CollectionStatus::PartialFailure => &bad,
            };
            let _ = writeln!(
                out,
                "{:<22} {} {:>10} {:>10} {:>8} {:>8.1}s",
                result.collection,
                style.apply_to(format!("{:<16}", status.label())),
                result.total_processed,
                result.total_written,
                result.total_failed,
                result.duration_ms as f64 / 1000.0
            );
        }

        let _ = writeln!(out, "{}", "-".repeat(80));
        let _ = writeln!(
            out,
            "{:<22} {:<16} {:>10} {:>10} {:>8} {:>8.1}s",
            bold.apply_to("TOTAL"),
            "",
            self.total_processed(),
            self.total_written(),
            self.total_failed(),
            self.duration_ms as f64 / 1000.0
        );
        let _ = writeln!(out, "Throughput: {:.0} records/sec", self.throughput());
        let _ = writeln!(
            out,
            "Written counts upserted rows; inserts and updates are not counted separately."
        );

        if let Some(halted) = &self.halted_at {
            let _ = writeln!(out, "{} {}", bad.apply_to("Halted at:"), halted);
        }
        if !self.not_run.is_empty() {
            let _ = writeln!(out, "Not run: {}", self.not_run.join(", "));
        }

        out
    }
}

fn styled(style: Style, colors: bool) -> Style {
    if colors {
        style
    } else {
        style.force_styling(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, processed: u64, failed: u64) -> MigrationResult {
        MigrationResult {
            collection: name.to_string(),
            total_processed: processed,
            total_written: processed - failed,
            total_failed: failed,
            batches: 1,
            duration_ms: 500,
            success: failed == 0,
            simulated: false,
        }
    }

    fn report(results: Vec<MigrationResult>, simulated: bool) -> MigrationReport {
        let now = Utc::now();
        MigrationReport {
            run_id: "run-1".to_string(),
            started_at: now,
            completed_at: now,
            simulated,
            results,
            halted_at: None,
            not_run: vec![],
            duration_ms: 1000,
        }
    }

    #[test]
    fn test_totals_and_throughput() {
        let report = report(
            vec![result("NIVELES", 250, 0), result("STEPS", 100, 10)],
            false,
        );
        assert_eq!(report.total_processed(), 350);
        assert_eq!(report.total_written(), 340);
        assert_eq!(report.total_failed(), 10);
        assert!((report.throughput() - 350.0).abs() < 0.001);
    }

    #[test]
    fn test_success_requires_all_collections() {
        assert!(report(vec![result("A", 10, 0)], false).is_success());
        assert!(!report(vec![result("A", 10, 1)], false).is_success());
    }

    #[test]
    fn test_dry_run_always_succeeds() {
        assert!(report(vec![result("A", 10, 1)], true).is_success());
    }

    #[test]
    fn test_exit_code_follows_success() {
        assert_eq!(
            format!("{:?}", report(vec![result("A", 10, 0)], false).exit_code()),
            format!("{:?}", ExitCode::SUCCESS)
        );
        assert_eq!(
            format!("{:?}", report(vec![result("A", 10, 3)], false).exit_code()),
            format!("{:?}", ExitCode::FAILURE)
        );
    }

    #[test]
    fn test_render_lists_every_collection() {
        let mut report = report(
            vec![result("NIVELES", 250, 0), result("STEPS", 100, 10)],
            false,
        );
        report.halted_at = Some("STEPS".to_string());
        report.not_run = vec!["PEOPLE".to_string(), "ACADEMICA".to_string()];

        let table = report.render(false);

        assert!(table.contains("NIVELES"));
        assert!(table.contains("SUCCESS"));
        assert!(table.contains("PARTIAL_FAILURE"));
        assert!(table.contains("TOTAL"));
        assert!(table.contains("Halted at: STEPS"));
        assert!(table.contains("Not run: PEOPLE, ACADEMICA"));
        assert!(table.contains("inserts and updates are not counted separately"));
        assert!(!table.contains('\u{1b}'));
    }

    #[test]
    fn test_render_dry_run_title() {
        let table = report(vec![], true).render(false);
        assert!(table.starts_with("Migration summary (dry run)"));
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report(vec![result("A", 1, 0)], false)).unwrap();
        assert_eq!(json["results"][0]["collection"], "A");
        assert_eq!(json["run_id"], "run-1");
    }
}
