/*!
 * # NHS Trust Performance Metrics Pipeline
 *
 * A Rust library for turning wide NHS performance CSV exports into nested,
 * validated trust-period records and loading them into a keyed table store.
 *
 * ## Features
 *
 * - 🗺️ **Declarative Column Mapping**: generate once from a header row, load as configuration
 * - 🔧 **Row Transformation**: flat CSV rows become nested RTT / A&E / diagnostics / capacity groups
 * - 🛡️ **Two-Tier Validation**: strict first, permissive fallback, with the accepting policy recorded
 * - 💾 **Idempotent Batch Upload**: upsert on `(trust_code, period)`, insert and per-record fallbacks
 * - 📊 **Run Reports**: JSON report, error report, markdown summary and recommendations
 * - 🧾 **Tender Normalization**: one canonical schema for procurement exports
 *
 * ## Quick Start
 *
 * ```no_run
 * use std::sync::Arc;
 * use nhs_metrics::prelude::*;
 *
 * # fn main() -> Result<()> {
 * let store = Arc::new(JsonFileStore::open("trust_metrics.json")?);
 * let config = ConfigBuilder::new().batch_size(100).build();
 *
 * let pipeline = BatchUploadPipeline::new(store, config);
 * let report = pipeline.run("data/trust_metrics_2025_01.csv")?;
 * report.print_summary();
 * # Ok(())
 * # }
 * ```
 *
 * ## Transforming and Validating Single Rows
 *
 * ```no_run
 * # use nhs_metrics::prelude::*;
 * # fn main() -> Result<()> {
 * # let row = SourceRow::default();
 * let transformer = RowTransformer::new(ColumnMapping::standard());
 * let outcome = transformer.try_transform(&row)?;
 *
 * let chain = ValidationChain::default();
 * let verdict = chain.evaluate(&outcome.record);
 * if let Some(mode) = verdict.accepted_by {
 *     println!("accepted under {} validation", mode);
 * }
 * # Ok(())
 * # }
 * ```
 *
 * ## Generating a Column Mapping
 *
 * ```no_run
 * # use nhs_metrics::prelude::*;
 * # fn main() -> Result<()> {
 * let headers = CsvSource::read_headers("data/trust_metrics_2025_01.csv")?;
 * let mapping = ColumnMapping::from_headers(&headers);
 * mapping.save("mapping.json")?;
 * # Ok(())
 * # }
 * ```
 *
 * ## Configuration
 *
 * ```no_run
 * # use nhs_metrics::prelude::*;
 * # use nhs_metrics::config::{PipelineConfig, TrustCodeOrder};
 * // Environment and ~/.config/nhs-metrics/config.toml
 * let config = PipelineConfig::load();
 *
 * // Or build your own
 * let config = ConfigBuilder::new()
 *     .batch_size(250)
 *     .trust_code_order(TrustCodeOrder::NormalizeThenValidate)
 *     .cross_field_checks(true)
 *     .build();
 * ```
 */

// Re-export error types from root
pub use error::{PipelineError, Result, ErrorContext, ExportFormat};

// Public modules
pub mod data_types;
pub mod schema;
pub mod reader;
pub mod transform;
pub mod validation;
pub mod context;
pub mod store;
pub mod pipeline;
pub mod report;
pub mod export;
pub mod tender;
pub mod logging;
pub mod error;
pub mod config;

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```
/// use nhs_metrics::prelude::*;
/// ```
pub mod prelude {
    pub use crate::data_types::*;
    pub use crate::schema::{ColumnMapping, ColumnSpec, TrustMetricsSchema};
    pub use crate::reader::CsvSource;
    pub use crate::transform::{RowTransformer, TransformOutcome};
    pub use crate::validation::{RecordValidator, ValidationChain, ValidationMode, ValidationResult};
    pub use crate::context::RunContext;
    pub use crate::store::{RecordStore, MemoryStore, JsonFileStore, StoreError, StoreErrorCode};
    #[cfg(feature = "remote")]
    pub use crate::store::RestStore;
    pub use crate::pipeline::BatchUploadPipeline;
    pub use crate::report::{PipelineReport, RunStatus};
    pub use crate::export::{RecordExporter, JsonExporter, SqlExporter};
    pub use crate::error::{PipelineError, Result};
    pub use crate::config::{ConfigBuilder, PipelineConfig};
    pub use crate::ExportFormat;
}

/// Export layout and pipeline constants
pub mod constants {
    /// Records per store write
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Upsert conflict target
    pub const CONFLICT_TARGET: &[&str] = &["trust_code", "period"];

    /// Default table name in the hosted store
    pub const DEFAULT_TABLE: &str = "trust_metrics";

    /// Trust names shorter than this are warned on
    pub const TRUST_NAME_MIN_LENGTH: usize = 3;

    /// Completeness below this ratio produces a warning
    pub const COMPLETENESS_WARNING_THRESHOLD: f64 = 0.5;

    /// Relative tolerance for the optional specialty-sum check
    pub const CROSS_FIELD_TOLERANCE: f64 = 0.15;

    /// Below this stored/processed ratio the report recommends investigation
    pub const SUCCESS_RATE_TARGET: f64 = 0.9;

    /// Rows read back from the store for the JSONB shape audit
    pub const DEFAULT_AUDIT_SAMPLE_SIZE: usize = 3;

    /// Columns that must exist before any row is processed
    pub const REQUIRED_COLUMNS: &[&str] = &[
        "trust_code",
        "trust_name",
        "period",
        "trust_total_total_incomplete_pathways",
        "trust_total_percent_within_18_weeks",
        "ae_attendances_total",
        "ae_4hr_performance_pct",
    ];

    /// Metric columns whose presence makes up transform-time completeness
    pub const CORE_METRIC_COLUMNS: &[&str] = &[
        "trust_total_total_incomplete_pathways",
        "trust_total_percent_within_18_weeks",
        "ae_attendances_total",
        "ae_4hr_performance_pct",
    ];

    pub const TRUST_TOTAL_PREFIX: &str = "trust_total_";
    pub const RTT_PREFIX: &str = "rtt_";
    pub const AE_PREFIX: &str = "ae_";
    pub const DIAGNOSTICS_PREFIX: &str = "diag_";
    pub const CAPACITY_PREFIX: &str = "capacity_";

    /// Metrics reported per RTT group (trust total and each specialty)
    pub const RTT_METRICS: &[&str] = &[
        "total_incomplete_pathways",
        "total_within_18_weeks",
        "total_over_18_weeks",
        "percent_within_18_weeks",
        "total_52_plus_weeks",
        "total_65_plus_weeks",
        "total_78_plus_weeks",
        "median_wait_weeks",
    ];

    pub const AE_METRICS: &[&str] = &[
        "attendances_total",
        "over_4hrs_total",
        "4hr_performance_pct",
        "emergency_admissions_total",
        "12hr_wait_admissions",
    ];

    pub const DIAGNOSTIC_METRICS: &[&str] = &[
        "total_waiting",
        "six_week_breaches",
        "thirteen_week_breaches",
        "planned_tests",
        "unscheduled_tests",
    ];

    pub const CAPACITY_METRICS: &[&str] = &[
        "virtual_ward_capacity",
        "virtual_ward_occupancy_rate",
        "avg_daily_discharges",
    ];

    /// Treatment functions in the standard RTT export
    pub const RTT_SPECIALTIES: &[&str] = &[
        "general_surgery",
        "urology",
        "trauma_orthopaedics",
        "ent",
        "ophthalmology",
        "oral_surgery",
        "neurosurgery",
        "plastic_surgery",
        "cardiothoracic_surgery",
        "general_internal_medicine",
        "gastroenterology",
        "cardiology",
        "dermatology",
        "respiratory_medicine",
        "neurology",
        "rheumatology",
        "geriatric_medicine",
        "gynaecology",
        "other",
    ];

    /// Test types in the standard diagnostics export
    pub const DIAGNOSTIC_TEST_TYPES: &[&str] = &[
        "mri",
        "computed_tomography",
        "non_obstetric_ultrasound",
        "dexa_scan",
        "audiology_assessments",
        "echocardiography",
        "neurophysiology",
        "sleep_studies",
        "urodynamics",
        "colonoscopy",
        "flexi_sigmoidoscopy",
        "cystoscopy",
        "gastroscopy",
    ];
}
