/*!
 * End-to-end tests for the batch upload pipeline
 *
 * Every test writes a small CSV export to a temporary directory, runs it
 * through the pipeline into an in-memory or JSON file store and checks the
 * run report and the stored rows.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nhs_metrics::config::TrustCodeOrder;
use nhs_metrics::context::WriteStrategy;
use nhs_metrics::prelude::*;
use tempfile::TempDir;

const HEADER: &str = "trust_code,trust_name,period,icb_code,icb_name,\
trust_total_total_incomplete_pathways,trust_total_percent_within_18_weeks,\
rtt_general_surgery_total_incomplete_pathways,rtt_general_surgery_percent_within_18_weeks,\
ae_attendances_total,ae_4hr_performance_pct,\
diag_mri_total_waiting,diag_mri_six_week_breaches,\
capacity_virtual_ward_capacity";

fn row(code: &str, name: &str, rtt_pct: &str) -> String {
    format!(
        "{},{},2025-01-01,QWE,South West London ICB,4500,{},800,55.0,12000,74.5,300,12,40",
        code, name, rtt_pct
    )
}

fn write_csv(dir: &Path, name: &str, header: &str, rows: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = String::from(header);
    contents.push('\n');
    for row in rows {
        contents.push_str(row);
        contents.push('\n');
    }
    fs::write(&path, contents).unwrap();
    path
}

fn config() -> ConfigBuilder {
    ConfigBuilder::new().progress_bar(false)
}

fn trust_code(i: usize) -> String {
    let letter = (b'A' + (i / 100) as u8) as char;
    format!("{}{:02}", letter, i % 100)
}

#[test]
fn valid_row_is_stored_and_lowercase_code_rejected_by_default() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(
        dir.path(),
        "metrics.csv",
        HEADER,
        &[row("R0A", "St George's University Hospitals", "58.2"), row("xyz", "Lowercase Trust", "60.1")],
    );

    let store = Arc::new(MemoryStore::new());
    let pipeline = BatchUploadPipeline::new(store.clone(), config().build());
    let report = pipeline.run(&csv).unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.processed_rows(), 2);
    assert_eq!(report.transform.failed_transforms, 1);
    assert_eq!(report.upload.stored, 1);
    assert_eq!(store.count().unwrap(), 1);

    let stored = store.records();
    assert_eq!(stored[0].trust_code, "R0A");
    let rtt = stored[0].rtt_data.as_ref().unwrap();
    assert_eq!(rtt.trust_total.get("percent_within_18_weeks"), Some(58.2));
    assert_eq!(rtt.specialties["general_surgery"].get("total_incomplete_pathways"), Some(800.0));
    assert_eq!(stored[0].diagnostics_data.as_ref().unwrap()["mri"].get("six_week_breaches"), Some(12.0));

    let error = &report.errors[0];
    assert_eq!(error.trust_code, "xyz");
    assert_eq!(error.line, Some(2));
}

#[test]
fn lowercase_code_is_normalized_when_configured() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(
        dir.path(),
        "metrics.csv",
        HEADER,
        &[row("R0A", "St George's University Hospitals", "58.2"), row("xyz", "Lowercase Trust", "60.1")],
    );

    let store = Arc::new(MemoryStore::new());
    let config = config().trust_code_order(TrustCodeOrder::NormalizeThenValidate).build();
    let report = BatchUploadPipeline::new(store.clone(), config).run(&csv).unwrap();

    assert_eq!(report.transform.failed_transforms, 0);
    assert_eq!(report.upload.stored, 2);
    let mut codes: Vec<String> = store.records().into_iter().map(|r| r.trust_code).collect();
    codes.sort();
    assert_eq!(codes, vec!["R0A", "XYZ"]);
}

#[test]
fn missing_required_header_aborts_before_any_row() {
    let dir = TempDir::new().unwrap();
    let header = HEADER.replace(",ae_4hr_performance_pct", "");
    let csv = write_csv(
        dir.path(),
        "metrics.csv",
        &header,
        &["R0A,Trust,2025-01-01,QWE,ICB,4500,58.2,800,55.0,12000,300,12,40".to_string()],
    );

    let store = Arc::new(MemoryStore::new());
    let report = BatchUploadPipeline::new(store.clone(), config().build()).run(&csv).unwrap();

    assert!(report.is_aborted());
    assert_eq!(report.processed_rows(), 0);
    assert!(!report.header_check.passed);
    assert_eq!(report.header_check.missing_columns, vec!["ae_4hr_performance_pct"]);
    assert!(report.fatal_error.as_deref().unwrap().contains("Header validation failed"));
    assert!(store.operations().is_empty());
}

#[test]
fn missing_file_is_fatal() {
    let pipeline = BatchUploadPipeline::new(Arc::new(MemoryStore::new()), config().build());
    let err = pipeline.run("/definitely/not/here.csv").unwrap_err();
    assert!(err.is_fatal_setup_error());
}

#[test]
fn accepted_records_flush_in_batches() {
    let dir = TempDir::new().unwrap();
    let rows: Vec<String> = (0..250).map(|i| row(&trust_code(i), "Batch Trust", "50")).collect();
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &rows);

    let store = Arc::new(MemoryStore::new());
    let report = BatchUploadPipeline::new(store.clone(), config().batch_size(100).build())
        .run(&csv)
        .unwrap();

    assert_eq!(report.upload.flush_sizes(), vec![100, 100, 50]);
    assert!(report.upload.flushes.iter().all(|f| f.strategy == WriteStrategy::Upsert));
    assert_eq!(store.count().unwrap(), 250);
}

#[test]
fn rerunning_an_export_is_idempotent_and_last_write_wins() {
    let dir = TempDir::new().unwrap();
    let first = write_csv(dir.path(), "first.csv", HEADER, &[row("R0A", "Old Name", "58.2")]);
    let second = write_csv(dir.path(), "second.csv", HEADER, &[row("R0A", "New Name", "61.0")]);

    let store = Arc::new(MemoryStore::new());
    let pipeline = BatchUploadPipeline::new(store.clone(), config().build());
    pipeline.run(&first).unwrap();
    pipeline.run(&second).unwrap();

    assert_eq!(store.count().unwrap(), 1);
    let stored = &store.records()[0];
    assert_eq!(stored.trust_name.as_deref(), Some("New Name"));
    assert_eq!(stored.rtt_data.as_ref().unwrap().trust_total.get("percent_within_18_weeks"), Some(61.0));
}

#[test]
fn rejected_batch_falls_back_to_per_record_writes() {
    let dir = TempDir::new().unwrap();
    let rows = vec![row("RA1", "Trust A", "50"), row("RB2", "Trust B", "50"), row("RC3", "Trust C", "50")];
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &rows);

    let store = Arc::new(MemoryStore::new().reject_trust_code("RB2"));
    let report = BatchUploadPipeline::new(store.clone(), config().build()).run(&csv).unwrap();

    assert_eq!(report.upload.per_record_fallbacks, 1);
    assert_eq!(report.upload.stored, 2);
    assert_eq!(report.upload.failed, 1);
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.errors.iter().any(|e| e.trust_code == "RB2"));
    assert!(report.recommendations.iter().any(|r| r.contains("per-record writes")));
}

#[test]
fn missing_unique_constraint_falls_back_to_insert() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &[row("RA1", "Trust A", "50"), row("RB2", "Trust B", "50")]);

    let store = Arc::new(MemoryStore::without_unique_constraint());
    let report = BatchUploadPipeline::new(store.clone(), config().build()).run(&csv).unwrap();

    assert_eq!(report.upload.insert_fallbacks, 1);
    assert_eq!(report.upload.flushes[0].strategy, WriteStrategy::Insert);
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn out_of_range_percentage_is_accepted_only_permissively() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &[row("R0A", "Trust A", "150")]);

    let strict = Arc::new(MemoryStore::new());
    let report = BatchUploadPipeline::new(strict.clone(), config().validation_chain(vec![ValidationMode::Strict]).build())
        .run(&csv)
        .unwrap();
    assert_eq!(report.validation.rejected, 1);
    assert_eq!(strict.count().unwrap(), 0);

    let chained = Arc::new(MemoryStore::new());
    let pipeline = BatchUploadPipeline::new(chained.clone(), config().build()).keep_accepted(true);
    let outcome = pipeline.run_detailed(&csv).unwrap();
    assert_eq!(outcome.report.validation.permissive_passed, 1);
    assert_eq!(chained.count().unwrap(), 1);
    assert_eq!(outcome.accepted[0].accepted_by, ValidationMode::Permissive);
    assert!(outcome.accepted[0].warnings.iter().any(|w| w.contains("percent_within_18_weeks")));
}

#[test]
fn missing_emergency_group_fails_strict_but_passes_permissive() {
    let record = TrustPeriodRecord {
        trust_code: "RJ1".to_string(),
        trust_name: Some("Guy's and St Thomas'".to_string()),
        period: "2025-01-01".to_string(),
        icb_code: Some("QKK".to_string()),
        rtt_data: Some(RttData {
            trust_total: MetricGroup::from_pairs([("total_incomplete_pathways", Some(100.0))]),
            ..Default::default()
        }),
        ae_data: None,
        diagnostics_data: Some([("mri".to_string(), MetricGroup::from_pairs([("total_waiting", Some(5.0))]))].into()),
        capacity_data: Some(MetricGroup::from_pairs([("virtual_ward_capacity", Some(10.0))])),
        ..Default::default()
    };

    let validator = RecordValidator::new();
    let strict = validator.validate(&record, ValidationMode::Strict);
    assert!(!strict.is_valid);
    assert!(strict.errors.iter().any(|e| e.contains("ae_data")));

    let permissive = validator.validate(&record, ValidationMode::Permissive);
    assert!(permissive.is_valid);
    assert!(permissive.warnings.iter().any(|w| w.contains("ae_data")));

    assert_eq!(ValidationChain::default().evaluate(&record).accepted_by, Some(ValidationMode::Permissive));
}

#[test]
fn malformed_line_is_counted_not_fatal() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(
        dir.path(),
        "metrics.csv",
        HEADER,
        &[row("RA1", "Trust A", "50"), "RB2,too,few".to_string(), row("RC3", "Trust C", "50")],
    );

    let store = Arc::new(MemoryStore::new());
    let report = BatchUploadPipeline::new(store.clone(), config().build()).run(&csv).unwrap();

    assert_eq!(report.processed_rows(), 3);
    assert_eq!(report.transform.failed_transforms, 1);
    assert_eq!(report.upload.stored, 2);
}

#[test]
fn null_tokens_become_missing_values() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(
        dir.path(),
        "metrics.csv",
        HEADER,
        &["R0A,Trust A,2025-01-01,QWE,ICB,null,,abc,55.0,12000,74.5,300,12,40".to_string()],
    );

    let store = Arc::new(MemoryStore::new());
    BatchUploadPipeline::new(store.clone(), config().build()).run(&csv).unwrap();

    let stored = &store.records()[0];
    let rtt = stored.rtt_data.as_ref().unwrap();
    assert_eq!(rtt.trust_total.get("total_incomplete_pathways"), None);
    assert_eq!(rtt.trust_total.get("percent_within_18_weeks"), None);
    assert!(rtt.trust_total.contains_field("percent_within_18_weeks"));
    assert_eq!(rtt.specialties["general_surgery"].get("total_incomplete_pathways"), None);
}

#[test]
fn json_file_store_persists_between_runs() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &[row("R0A", "Trust A", "50")]);
    let table = dir.path().join("trust_metrics.json");

    {
        let store = Arc::new(JsonFileStore::open(&table).unwrap());
        BatchUploadPipeline::new(store, config().build()).run(&csv).unwrap();
    }

    let reopened = JsonFileStore::open(&table).unwrap();
    assert_eq!(reopened.count().unwrap(), 1);
    assert_eq!(reopened.records()[0].trust_code, "R0A");
}

#[test]
fn run_many_gives_each_file_its_own_report() {
    let dir = TempDir::new().unwrap();
    let a = write_csv(dir.path(), "a.csv", HEADER, &[row("RA1", "Trust A", "50")]);
    let b = write_csv(dir.path(), "b.csv", HEADER, &[row("RB1", "Trust B", "50"), row("RB2", "Trust B2", "50")]);

    let store = Arc::new(MemoryStore::new());
    let reports = BatchUploadPipeline::new(store.clone(), config().build()).run_many(&[a, b]);

    let reports: Vec<PipelineReport> = reports.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(reports[0].upload.stored, 1);
    assert_eq!(reports[1].upload.stored, 2);
    assert_ne!(reports[0].run_id, reports[1].run_id);
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn parallel_runs_share_a_json_file_store_without_losing_rows() {
    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..4)
        .map(|file| {
            let rows: Vec<String> = (0..40).map(|i| row(&trust_code(file * 100 + i), "Shared Trust", "50")).collect();
            write_csv(dir.path(), &format!("part{}.csv", file), HEADER, &rows)
        })
        .collect();
    let table = dir.path().join("trust_metrics.json");

    let store = Arc::new(JsonFileStore::open(&table).unwrap());
    let reports = BatchUploadPipeline::new(store.clone(), config().batch_size(1).build()).run_many(&paths);

    for report in reports {
        let report = report.unwrap();
        assert_eq!(report.upload.stored, 40);
        assert_eq!(report.upload.failed, 0);
    }
    assert_eq!(store.count().unwrap(), 160);
    assert_eq!(JsonFileStore::open(&table).unwrap().count().unwrap(), 160);
}

#[test]
fn report_artifacts_are_written() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(dir.path(), "metrics.csv", HEADER, &[row("R0A", "Trust A", "50"), row("bad", "Trust B", "50")]);
    let report_dir = dir.path().join("reports");

    let report = BatchUploadPipeline::new(Arc::new(MemoryStore::new()), config().build())
        .run(&csv)
        .unwrap();
    let artifacts = report.write_artifacts(&report_dir).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&artifacts.report_json).unwrap()).unwrap();
    assert_eq!(json["run_id"], report.run_id.as_str());
    let errors: serde_json::Value = serde_json::from_str(&fs::read_to_string(&artifacts.error_report).unwrap()).unwrap();
    assert_eq!(errors["error_count"], 1);
    assert!(fs::read_to_string(&artifacts.summary_markdown).unwrap().contains(&report.run_id));
    assert_eq!(report.jsonb_audit.well_formed, 1);
    assert!(!report.jsonb_audit.has_issues());
}
