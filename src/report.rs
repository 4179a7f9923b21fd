/*!
 * Run reports
 *
 * A [`PipelineReport`] is built from the run context once the stream is
 * exhausted (or once the header pre-check aborts the run). It can be
 * printed, rendered as markdown, and written out as timestamped artifacts.
 */

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{COMPLETENESS_WARNING_THRESHOLD, SUCCESS_RATE_TARGET};
use crate::context::{RowError, RunContext, TransformStats, UploadStats, ValidationStats};
use crate::Result;

/// JSON columns that must come back from the store as objects
pub const JSONB_COLUMNS: &[&str] = &["rtt_data", "ae_data", "diagnostics_data", "capacity_data"];

/// File name of the per-run row error listing
pub const ERROR_REPORT_FILE: &str = "transformation_error_report.json";

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The stream was processed to the end; row rejections do not change this
    Completed,
    /// Stopped before any row was processed
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of the header pre-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCheck {
    pub passed: bool,
    pub found_columns: usize,
    pub missing_columns: Vec<String>,
}

/// Shape check of rows read back from the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonbAudit {
    pub sampled: usize,
    pub well_formed: usize,
    pub issues: Vec<String>,
    /// Most specialties seen in one sampled row
    pub specialty_count: usize,
    /// Most diagnostic test types seen in one sampled row
    pub diagnostic_test_count: usize,
    /// Set when the sample could not be read
    #[serde(default)]
    pub error: Option<String>,
}

impl JsonbAudit {
    /// Audit sampled rows; each JSON column must be an object or absent
    pub fn from_rows(rows: &[serde_json::Value]) -> Self {
        let mut audit = JsonbAudit {
            sampled: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let label = match (row.get("trust_code").and_then(|v| v.as_str()), row.get("period").and_then(|v| v.as_str())) {
                (Some(code), Some(period)) => format!("{}/{}", code, period),
                _ => "row".to_string(),
            };
            let mut ok = true;

            for column in JSONB_COLUMNS {
                let kind = match row.get(*column) {
                    None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => continue,
                    Some(serde_json::Value::String(_)) => "a string",
                    Some(serde_json::Value::Array(_)) => "an array",
                    Some(_) => "a scalar",
                };
                ok = false;
                audit.issues.push(format!("{} {} is stored as {}, expected an object", label, column, kind));
            }

            let specialties = row.pointer("/rtt_data/specialties")
                .and_then(|v| v.as_object())
                .map(|m| m.len())
                .unwrap_or(0);
            let tests = row.get("diagnostics_data")
                .and_then(|v| v.as_object())
                .map(|m| m.len())
                .unwrap_or(0);
            audit.specialty_count = audit.specialty_count.max(specialties);
            audit.diagnostic_test_count = audit.diagnostic_test_count.max(tests);

            if ok {
                audit.well_formed += 1;
            }
        }

        audit
    }

    /// Audit that could not run
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty() || self.error.is_some()
    }
}

/// Paths of the artifacts written for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ReportArtifacts {
    pub report_json: PathBuf,
    pub error_report: PathBuf,
    pub summary_markdown: PathBuf,
}

/// Everything known about one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub source: Option<PathBuf>,
    pub store: String,
    pub batch_size: usize,
    pub status: RunStatus,
    pub fatal_error: Option<String>,
    pub header_check: HeaderCheck,
    pub transform: TransformStats,
    pub validation: ValidationStats,
    pub average_completeness: f64,
    pub upload: UploadStats,
    pub errors: Vec<RowError>,
    pub jsonb_audit: JsonbAudit,
    pub recommendations: Vec<String>,
}

impl PipelineReport {
    /// Report of a run that processed its stream
    pub fn completed(ctx: &RunContext, store: &str, batch_size: usize, header_check: HeaderCheck, jsonb_audit: JsonbAudit) -> Self {
        Self::build(ctx, store, batch_size, RunStatus::Completed, None, header_check, jsonb_audit)
    }

    /// Report of a run stopped before any row was processed
    pub fn aborted(ctx: &RunContext, store: &str, batch_size: usize, header_check: HeaderCheck, fatal_error: impl Into<String>) -> Self {
        Self::build(
            ctx,
            store,
            batch_size,
            RunStatus::Aborted,
            Some(fatal_error.into()),
            header_check,
            JsonbAudit::default(),
        )
    }

    fn build(
        ctx: &RunContext,
        store: &str,
        batch_size: usize,
        status: RunStatus,
        fatal_error: Option<String>,
        header_check: HeaderCheck,
        jsonb_audit: JsonbAudit,
    ) -> Self {
        let finished_at = Utc::now();
        let duration = finished_at.signed_duration_since(ctx.started_at);
        let mut report = Self {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            finished_at,
            duration_secs: duration.num_milliseconds().max(0) as f64 / 1000.0,
            source: ctx.source.clone(),
            store: store.to_string(),
            batch_size,
            status,
            fatal_error,
            header_check,
            transform: ctx.transform.clone(),
            validation: ctx.validation.clone(),
            average_completeness: ctx.validation.average_completeness(),
            upload: ctx.upload.clone(),
            errors: ctx.errors.clone(),
            jsonb_audit,
            recommendations: Vec::new(),
        };
        report.recommendations = report.build_recommendations();
        report
    }

    /// Data lines read, malformed ones included
    pub fn processed_rows(&self) -> usize {
        self.transform.rows_read
    }

    /// Stored records as a share of processed rows
    pub fn success_rate(&self) -> f64 {
        if self.processed_rows() == 0 {
            0.0
        } else {
            self.upload.stored as f64 / self.processed_rows() as f64
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }

    fn build_recommendations(&self) -> Vec<String> {
        let mut recs = Vec::new();

        if self.is_aborted() {
            if !self.header_check.missing_columns.is_empty() {
                recs.push(format!(
                    "Add the missing required columns to the export: {}",
                    self.header_check.missing_columns.join(", ")
                ));
            } else {
                recs.push("Fix the setup error and rerun the pipeline".to_string());
            }
            return recs;
        }

        if self.processed_rows() == 0 {
            recs.push("No data rows were found; check that the export is not empty".to_string());
            return recs;
        }

        let rate = self.success_rate();
        if rate < SUCCESS_RATE_TARGET {
            recs.push(format!(
                "Success rate {:.1}% is below {:.0}%; review {}",
                rate * 100.0,
                SUCCESS_RATE_TARGET * 100.0,
                ERROR_REPORT_FILE
            ));
        }
        if self.transform.failed_transforms > 0 {
            recs.push(format!(
                "{} rows failed transformation; check trust codes, periods and CSV quoting",
                self.transform.failed_transforms
            ));
        }
        if self.validation.permissive_passed > 0 {
            recs.push(format!(
                "{} records were accepted only under permissive validation; review their data quality warnings",
                self.validation.permissive_passed
            ));
        }
        if self.validation.rejected > 0 {
            recs.push(format!("{} records failed every validation policy", self.validation.rejected));
        }
        if self.upload.insert_fallbacks > 0 {
            recs.push("Upserts were rejected for lack of a unique constraint; add UNIQUE (trust_code, period) to the table".to_string());
        }
        if self.upload.per_record_fallbacks > 0 {
            recs.push(format!(
                "{} batches fell back to per-record writes and {} records failed; inspect the upload errors",
                self.upload.per_record_fallbacks, self.upload.failed
            ));
        }
        if self.validation.validated > 0 && self.average_completeness < COMPLETENESS_WARNING_THRESHOLD {
            recs.push(format!(
                "Average data completeness is {:.1}%; check that the export includes the metric columns",
                self.average_completeness * 100.0
            ));
        }
        if self.jsonb_audit.has_issues() {
            recs.push(match &self.jsonb_audit.error {
                Some(e) => format!("The JSONB audit could not read back stored rows: {}", e),
                None => format!(
                    "The JSONB audit found {} issues; metric groups must be stored as JSON objects",
                    self.jsonb_audit.issues.len()
                ),
            });
        }

        if recs.is_empty() {
            recs.push("No issues found; all rows were transformed, validated and stored".to_string());
        }
        recs
    }

    /// Render the run summary as markdown
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("# Pipeline Run Summary\n\n");
        md.push_str(&format!("- **Run:** `{}`\n", self.run_id));
        if let Some(source) = &self.source {
            md.push_str(&format!("- **Source:** `{}`\n", source.display()));
        }
        md.push_str(&format!("- **Status:** {}\n", self.status));
        md.push_str(&format!("- **Started:** {}\n", self.started_at.to_rfc3339()));
        md.push_str(&format!("- **Duration:** {:.2}s\n", self.duration_secs));
        md.push_str(&format!("- **Store:** {}\n", self.store));
        if let Some(err) = &self.fatal_error {
            md.push_str(&format!("- **Fatal error:** {}\n", err));
        }

        md.push_str("\n## Counts\n\n| stage | count |\n|---|---|\n");
        md.push_str(&format!("| rows processed | {} |\n", self.processed_rows()));
        md.push_str(&format!("| transformed | {} |\n", self.transform.successful_transforms));
        md.push_str(&format!("| transform failures | {} |\n", self.transform.failed_transforms));
        md.push_str(&format!("| accepted (strict) | {} |\n", self.validation.strict_passed));
        md.push_str(&format!("| accepted (permissive) | {} |\n", self.validation.permissive_passed));
        md.push_str(&format!("| rejected by validation | {} |\n", self.validation.rejected));
        md.push_str(&format!("| stored | {} |\n", self.upload.stored));
        md.push_str(&format!("| upload failures | {} |\n", self.upload.failed));
        md.push_str(&format!("\nSuccess rate: {:.1}%  \n", self.success_rate() * 100.0));
        md.push_str(&format!("Average completeness: {:.1}%\n", self.average_completeness * 100.0));

        if !self.upload.flushes.is_empty() {
            md.push_str("\n## Batches\n\n| # | size | write | stored | failed |\n|---|---|---|---|---|\n");
            for flush in &self.upload.flushes {
                md.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    flush.index + 1, flush.size, flush.strategy, flush.stored, flush.failed
                ));
            }
        }

        md.push_str("\n## JSONB Audit\n\n");
        md.push_str(&format!(
            "{} of {} sampled rows well-formed ({} specialties, {} diagnostic test types)\n",
            self.jsonb_audit.well_formed,
            self.jsonb_audit.sampled,
            self.jsonb_audit.specialty_count,
            self.jsonb_audit.diagnostic_test_count
        ));
        for issue in &self.jsonb_audit.issues {
            md.push_str(&format!("- {}\n", issue));
        }

        md.push_str("\n## Recommendations\n\n");
        for rec in &self.recommendations {
            md.push_str(&format!("- {}\n", rec));
        }
        md
    }

    /// Print a summary to stdout
    pub fn print_summary(&self) {
        println!("Pipeline Run {}", self.run_id);
        println!("====================");
        if let Some(source) = &self.source {
            println!("Source: {}", source.display());
        }
        println!("Status: {}", self.status);
        if let Some(err) = &self.fatal_error {
            println!("Fatal error: {}", err);
        }
        println!("Rows processed: {}", self.processed_rows());
        println!(
            "Transformed: {} ({} failed)",
            self.transform.successful_transforms, self.transform.failed_transforms
        );
        println!(
            "Validation: {} strict, {} permissive, {} rejected",
            self.validation.strict_passed, self.validation.permissive_passed, self.validation.rejected
        );
        println!(
            "Stored: {} in {} batches ({} failed)",
            self.upload.stored,
            self.upload.flushes.len(),
            self.upload.failed
        );
        println!("Success rate: {:.1}%", self.success_rate() * 100.0);
        println!("Average completeness: {:.1}%", self.average_completeness * 100.0);
        println!("Duration: {:.2}s", self.duration_secs);

        println!("\nRecommendations:");
        for rec in &self.recommendations {
            println!("  - {}", rec);
        }
    }

    /// Write the JSON report, the error report and the markdown summary
    ///
    /// Timestamped files are never overwritten; the error report always
    /// reflects the latest run.
    pub fn write_artifacts<P: AsRef<Path>>(&self, dir: P) -> Result<ReportArtifacts> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let stamp = self.finished_at.format("%Y%m%d_%H%M%S").to_string();

        let report_json = write_unique(
            dir,
            &format!("pipeline_report_{}", stamp),
            &self.run_id,
            "json",
            &serde_json::to_string_pretty(self)?,
        )?;

        let error_report = dir.join(ERROR_REPORT_FILE);
        let errors = serde_json::json!({
            "run_id": self.run_id,
            "generated_at": self.finished_at,
            "source": self.source,
            "error_count": self.errors.len(),
            "errors": self.errors,
        });
        fs::write(&error_report, serde_json::to_string_pretty(&errors)?)?;

        let summary_markdown = write_unique(
            dir,
            &format!("pipeline_summary_{}", stamp),
            &self.run_id,
            "md",
            &self.to_markdown(),
        )?;

        log::info!(
            "[run={}] REPORT_WRITTEN report={} summary={}",
            self.run_id,
            report_json.display(),
            summary_markdown.display()
        );

        Ok(ReportArtifacts {
            report_json,
            error_report,
            summary_markdown,
        })
    }
}

/// Attempts at a free artifact name before giving up
const MAX_ARTIFACT_NAME_ATTEMPTS: usize = 1000;

/// Create a new file named `<stem>.<ext>`, then `<stem>_<run id>.<ext>`,
/// then `<stem>_<run id>_<n>.<ext>`, taking the first name nobody holds
fn write_unique(dir: &Path, stem: &str, run_id: &str, ext: &str, contents: &str) -> Result<PathBuf> {
    for attempt in 0..MAX_ARTIFACT_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{}.{}", stem, ext),
            1 => format!("{}_{}.{}", stem, run_id, ext),
            n => format!("{}_{}_{}.{}", stem, run_id, n, ext),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents.as_bytes())?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {}.{} in {} after {} attempts", stem, ext, dir.display(), MAX_ARTIFACT_NAME_ATTEMPTS),
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FlushRecord, WriteStrategy};
    use serde_json::json;

    fn header_ok() -> HeaderCheck {
        HeaderCheck { passed: true, found_columns: 7, missing_columns: Vec::new() }
    }

    #[test]
    fn test_jsonb_audit_flags_strings() {
        let rows = vec![
            json!({"trust_code": "R0A", "period": "2025-01-01", "rtt_data": {"trust_total": {}, "specialties": {"cardiology": {}}}, "ae_data": {}}),
            json!({"trust_code": "RJ1", "period": "2025-01-01", "ae_data": "{\"attendances_total\": 1}"}),
        ];
        let audit = JsonbAudit::from_rows(&rows);
        assert_eq!(audit.sampled, 2);
        assert_eq!(audit.well_formed, 1);
        assert_eq!(audit.issues.len(), 1);
        assert!(audit.issues[0].contains("RJ1/2025-01-01 ae_data"));
        assert_eq!(audit.specialty_count, 1);
    }

    #[test]
    fn test_clean_run_recommendation() {
        let mut ctx = RunContext::new();
        ctx.transform.rows_read = 2;
        ctx.transform.successful_transforms = 2;
        ctx.upload.record_flush(FlushRecord { index: 0, size: 2, strategy: WriteStrategy::Upsert, stored: 2, failed: 0 });

        let report = PipelineReport::completed(&ctx, "memory", 100, header_ok(), JsonbAudit::default());
        assert_eq!(report.success_rate(), 1.0);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].starts_with("No issues"));
    }

    #[test]
    fn test_recommendations_for_problems() {
        let mut ctx = RunContext::new();
        ctx.transform.rows_read = 10;
        ctx.transform.successful_transforms = 8;
        ctx.transform.failed_transforms = 2;
        ctx.upload.record_flush(FlushRecord { index: 0, size: 8, strategy: WriteStrategy::Insert, stored: 8, failed: 0 });

        let report = PipelineReport::completed(&ctx, "memory", 100, header_ok(), JsonbAudit::default());
        assert!(report.success_rate() < SUCCESS_RATE_TARGET);
        assert!(report.recommendations.iter().any(|r| r.contains("below 90%")));
        assert!(report.recommendations.iter().any(|r| r.contains("failed transformation")));
        assert!(report.recommendations.iter().any(|r| r.contains("unique constraint")));
    }

    #[test]
    fn test_aborted_report() {
        let ctx = RunContext::new();
        let check = HeaderCheck {
            passed: false,
            found_columns: 6,
            missing_columns: vec!["ae_4hr_performance_pct".to_string()],
        };
        let report = PipelineReport::aborted(&ctx, "memory", 100, check, "missing columns");
        assert!(report.is_aborted());
        assert_eq!(report.processed_rows(), 0);
        assert!(report.recommendations[0].contains("ae_4hr_performance_pct"));
    }

    #[test]
    fn test_write_artifacts_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let report = PipelineReport::completed(&RunContext::new(), "memory", 100, header_ok(), JsonbAudit::default());

        let first = report.write_artifacts(dir.path()).unwrap();
        let second = report.write_artifacts(dir.path()).unwrap();
        assert_ne!(first.report_json, second.report_json);
        assert!(first.summary_markdown.exists());
        assert!(second.error_report.exists());

        let loaded: PipelineReport = serde_json::from_str(&fs::read_to_string(&first.report_json).unwrap()).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
    }

    #[test]
    fn test_repeated_artifact_writes_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let report = PipelineReport::completed(&RunContext::new(), "memory", 100, header_ok(), JsonbAudit::default());

        let written: Vec<ReportArtifacts> = (0..4).map(|_| report.write_artifacts(dir.path()).unwrap()).collect();
        let mut reports: Vec<&PathBuf> = written.iter().map(|a| &a.report_json).collect();
        let mut summaries: Vec<&PathBuf> = written.iter().map(|a| &a.summary_markdown).collect();
        reports.sort();
        reports.dedup();
        summaries.sort();
        summaries.dedup();
        assert_eq!(reports.len(), 4);
        assert_eq!(summaries.len(), 4);
        assert!(written[3].report_json.to_string_lossy().ends_with(&format!("_{}_3.json", report.run_id)));
    }
}
