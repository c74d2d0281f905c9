// 📋 Audit & Exception Reporter
// Run summaries (persisted, queryable) and the exceptions report file.

use crate::config::ImportConfig;
use crate::entities::EntityKind;
use crate::executor::{ConflictPolicy, ImportException, ImportRunResult, KindCounters};
use crate::schema::ValidationError;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// round((created + updated) / processed × 100, 1 decimal); 0 for an empty run
pub fn success_rate(created: usize, updated: usize, total_processed: usize) -> f64 {
    if total_processed == 0 {
        return 0.0;
    }
    let rate = (created + updated) as f64 / total_processed as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// Persisted record of one run (counts only, no exception bodies)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub actor: String,
    pub source_path: String,
    pub policy: ConflictPolicy,
    pub preview: bool,
    pub cancelled: bool,
    pub per_kind: BTreeMap<EntityKind, KindCounters>,
    pub totals: KindCounters,
    pub total_processed: usize,
    pub success_rate: f64,
    pub skipped_entities: Vec<EntityKind>,
    pub validation_error_count: usize,
    pub warning_count: usize,
    pub exception_count: usize,
}

impl RunSummary {
    pub fn from_result(result: &ImportRunResult) -> Self {
        let totals = result.totals();
        RunSummary {
            id: result.run_id.clone(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            actor: result.actor.clone(),
            source_path: result.source_path.clone(),
            policy: result.policy,
            preview: result.preview,
            cancelled: result.cancelled,
            per_kind: result.per_kind.clone(),
            totals,
            total_processed: totals.processed(),
            success_rate: success_rate(totals.created, totals.updated, totals.processed()),
            skipped_entities: result.skipped_entities.clone(),
            validation_error_count: result.validation_errors.len(),
            warning_count: result.warnings.len(),
            exception_count: result.exceptions.len(),
        }
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at.map(|end| (end - self.started_at).num_seconds())
    }
}

// ============================================================================
// EXCEPTIONS REPORT
// ============================================================================

#[derive(Debug, Serialize)]
struct ExceptionReport<'a> {
    summary: RunSummary,
    validation_errors: &'a [ValidationError],
    exceptions: &'a [ImportException],
}

/// Flat CSV row; one per exception
#[derive(Debug, Serialize)]
struct ExceptionRow<'a> {
    entity_type: &'static str,
    natural_key: Option<&'a str>,
    field: Option<&'a str>,
    reason: &'a str,
    original_value: Option<&'a str>,
    line: Option<usize>,
}

/// `<dir>/<dir name>_exceptions_<YYYY-MM-DD>.json`
pub fn default_report_path(input_dir: &Path, report_dir: Option<&Path>, date: NaiveDate) -> PathBuf {
    let stem = input_dir
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("import");
    report_dir
        .unwrap_or(input_dir)
        .join(format!("{}_exceptions_{}.json", stem, date.format("%Y-%m-%d")))
}

/// Whether there is anything to remediate
pub fn needs_report(result: &ImportRunResult) -> bool {
    !result.exceptions.is_empty() || !result.validation_errors.is_empty()
}

/// Write the report as JSON, or as an exceptions CSV for a `.csv` path
pub fn write_report(result: &ImportRunResult, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

    if is_csv {
        write_csv(result, path)?;
    } else {
        let report = ExceptionReport {
            summary: RunSummary::from_result(result),
            validation_errors: &result.validation_errors,
            exceptions: &result.exceptions,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    }

    info!(path = %path.display(), exceptions = result.exceptions.len(), "exceptions report written");
    Ok(())
}

fn write_csv(result: &ImportRunResult, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for exception in &result.exceptions {
        writer.serialize(ExceptionRow {
            entity_type: exception.entity_type.name(),
            natural_key: exception.natural_key.as_deref(),
            field: exception.field.as_deref(),
            reason: &exception.reason,
            original_value: exception.original_value.as_deref(),
            line: exception.line,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the report when needed: to `output` if given, else the default
/// path. Returns where it went.
pub fn write_report_if_needed(
    result: &ImportRunResult,
    input_dir: &Path,
    config: &ImportConfig,
    output: Option<&Path>,
) -> Result<Option<PathBuf>> {
    if !needs_report(result) {
        return Ok(None);
    }
    let path = match output {
        Some(path) => path.to_path_buf(),
        None => default_report_path(
            input_dir,
            config.report_dir.as_deref(),
            result.started_at.date_naive(),
        ),
    };
    write_report(result, &path)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ImportStore, MemoryStore, SqliteStore};

    fn sample_result() -> ImportRunResult {
        let mut result = ImportRunResult::new(
            "tester",
            Path::new("/data/ecole_2023"),
            ConflictPolicy::SkipExisting,
            false,
        );
        let schools = result.per_kind.get_mut(&EntityKind::School).unwrap();
        schools.created = 8;
        schools.updated = 2;
        result.exceptions.push(ImportException {
            entity_type: EntityKind::Student,
            natural_key: Some("1001".to_string()),
            field: Some("Student Ref".to_string()),
            reason: "Student '1001' already exists (id 3)".to_string(),
            original_value: None,
            line: Some(14),
        });
        result
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0, 0), 0.0);
        assert_eq!(success_rate(8, 2, 10), 100.0);
        assert_eq!(success_rate(1, 0, 3), 33.3);
        assert_eq!(success_rate(2, 0, 3), 66.7);
    }

    #[test]
    fn test_summary_totals_match_per_kind() {
        let summary = RunSummary::from_result(&sample_result());
        assert_eq!(summary.totals.created, 8);
        assert_eq!(summary.total_processed, 10);
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(summary.exception_count, 1);
    }

    #[test]
    fn test_default_report_path() {
        let date = NaiveDate::from_ymd_opt(2024, 9, 3).unwrap();
        assert_eq!(
            default_report_path(Path::new("/data/ecole_2023"), None, date),
            PathBuf::from("/data/ecole_2023/ecole_2023_exceptions_2024-09-03.json")
        );
        assert_eq!(
            default_report_path(Path::new("/data/ecole_2023"), Some(Path::new("/reports")), date),
            PathBuf::from("/reports/ecole_2023_exceptions_2024-09-03.json")
        );
    }

    #[test]
    fn test_write_json_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");

        write_report(&sample_result(), &path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["success_rate"], 100.0);
        assert_eq!(json["exceptions"][0]["natural_key"], "1001");
        assert_eq!(json["exceptions"][0]["entity_type"], "Student");
    }

    #[test]
    fn test_write_csv_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exceptions.csv");

        write_report(&sample_result(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "entity_type");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "1001");
        assert_eq!(&rows[0][5], "14");
    }

    #[test]
    fn test_no_report_without_exceptions() {
        let dir = tempfile::tempdir().unwrap();
        let clean = ImportRunResult::new("tester", dir.path(), ConflictPolicy::default(), false);

        let written =
            write_report_if_needed(&clean, dir.path(), &ImportConfig::default(), None).unwrap();
        assert_eq!(written, None);
    }

    #[test]
    fn test_run_history_most_recent_first() {
        for mut store in [
            Box::new(SqliteStore::open_in_memory().unwrap()) as Box<dyn ImportStore>,
            Box::new(MemoryStore::new()),
        ] {
            let mut older = RunSummary::from_result(&sample_result());
            older.started_at = Utc::now() - chrono::Duration::hours(1);
            let newer = RunSummary::from_result(&sample_result());

            store.save_run(&older).unwrap();
            store.save_run(&newer).unwrap();

            let runs = store.recent_runs(10).unwrap();
            assert_eq!(runs.len(), 2);
            assert_eq!(runs[0].id, newer.id);
            assert_eq!(store.recent_runs(1).unwrap().len(), 1);
            assert_eq!(store.get_run(&older.id).unwrap(), Some(older));
            assert_eq!(store.get_run("missing").unwrap(), None);
        }
    }
}
