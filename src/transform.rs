/*!
 * Row transformer: flat CSV row to nested trust-period record
 *
 * Metadata is validated here (trust code, period); metric values are coerced
 * leniently. A value that cannot be read as a non-negative finite number
 * becomes null rather than failing the row, so one bad cell never costs the
 * whole observation. Every mapped field is emitted, populated or not.
 */

use crate::config::{PipelineConfig, TrustCodeOrder};
use crate::constants::{COMPLETENESS_WARNING_THRESHOLD, CORE_METRIC_COLUMNS};
use crate::context::{ErrorStage, RowError, RunContext};
use crate::data_types::{MetricGroup, Period, RttData, SourceRow, TrustCode, TrustPeriodRecord};
use crate::schema::{ColumnMapping, ColumnSpec, MetadataColumns};
use crate::{ErrorContext, PipelineError, Result};

/// Cell values read as "no value"
const NULL_TOKENS: &[&str] = &["null", "undefined", "nan"];

/// Knobs that change how rows are transformed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformOptions {
    pub trust_code_order: TrustCodeOrder,
    pub completeness_threshold: f64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            trust_code_order: TrustCodeOrder::default(),
            completeness_threshold: COMPLETENESS_WARNING_THRESHOLD,
        }
    }
}

impl From<&PipelineConfig> for TransformOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            trust_code_order: config.trust_code_order,
            completeness_threshold: config.completeness_threshold,
        }
    }
}

/// A transformed record plus the non-fatal findings about its row
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub record: TrustPeriodRecord,
    pub warnings: Vec<String>,
    /// Share of the core metric columns holding a value
    pub core_completeness: f64,
}

/// Turns source rows into trust-period records using a column mapping
#[derive(Debug, Clone)]
pub struct RowTransformer {
    mapping: ColumnMapping,
    options: TransformOptions,
}

impl RowTransformer {
    pub fn new(mapping: ColumnMapping) -> Self {
        Self::with_options(mapping, TransformOptions::default())
    }

    pub fn with_options(mapping: ColumnMapping, options: TransformOptions) -> Self {
        Self { mapping, options }
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn options(&self) -> TransformOptions {
        self.options
    }

    /// Transform one row, counting the outcome in the run context
    ///
    /// Returns `None` for a rejected row; the reason is recorded as a
    /// [`RowError`] carrying the row number and whatever key fields it had.
    pub fn transform(&self, row: &SourceRow, ctx: &mut RunContext) -> Option<TrustPeriodRecord> {
        match self.try_transform(row) {
            Ok(outcome) => {
                ctx.transform.successful_transforms += 1;
                if outcome.core_completeness < self.options.completeness_threshold {
                    ctx.transform.low_completeness_warnings += 1;
                }
                for warning in &outcome.warnings {
                    log::debug!("{} TRANSFORM_WARNING {}", ctx.log_context().with_row(row.line), warning);
                }
                Some(outcome.record)
            }
            Err(e) => {
                ctx.transform.failed_transforms += 1;
                let metadata = &self.mapping.metadata;
                ctx.push_error(RowError::new(
                    Some(row.line),
                    row.get(&metadata.trust_code),
                    row.get(&metadata.period),
                    ErrorStage::Transform,
                    e.to_string(),
                ));
                None
            }
        }
    }

    /// Transform one row without touching any counters
    pub fn try_transform(&self, row: &SourceRow) -> Result<TransformOutcome> {
        let metadata = &self.mapping.metadata;

        let raw_code = row.get(&metadata.trust_code)
            .ok_or_else(|| missing_field(row, metadata, &metadata.trust_code))?;
        let trust_code = match self.options.trust_code_order {
            TrustCodeOrder::ValidateThenNormalize => TrustCode::parse(raw_code)?,
            TrustCodeOrder::NormalizeThenValidate => TrustCode::normalize(raw_code)?,
        };

        let raw_period = row.get(&metadata.period)
            .ok_or_else(|| missing_field(row, metadata, &metadata.period))?;
        let period = Period::parse(raw_period)?;

        let record = TrustPeriodRecord {
            trust_code: trust_code.to_string(),
            trust_name: row.get(&metadata.trust_name).map(str::to_string),
            period: period.to_string(),
            icb_code: row.get(&metadata.icb_code).map(str::to_string),
            icb_name: row.get(&metadata.icb_name).map(str::to_string),
            rtt_data: Some(RttData {
                trust_total: build_group(row, &self.mapping.rtt_trust_total),
                specialties: self.mapping.rtt_specialties.iter()
                    .map(|(name, specs)| (name.clone(), build_group(row, specs)))
                    .collect(),
            }),
            ae_data: Some(build_group(row, &self.mapping.ae)),
            diagnostics_data: Some(
                self.mapping.diagnostics.iter()
                    .map(|(test, specs)| (test.clone(), build_group(row, specs)))
                    .collect(),
            ),
            capacity_data: Some(build_group(row, &self.mapping.capacity)),
        };

        let core_completeness = core_completeness(row);
        let mut warnings = Vec::new();
        if core_completeness < self.options.completeness_threshold {
            warnings.push(format!(
                "Low core metric completeness for {}: {:.0}%",
                record.key(),
                core_completeness * 100.0
            ));
        }

        Ok(TransformOutcome { record, warnings, core_completeness })
    }
}

/// Coerce one raw cell into a metric value
///
/// Empty, `null`, `undefined`, `NaN`, non-numeric, negative and non-finite
/// values all become `None`. Thousands separators are accepted.
pub fn coerce_metric(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() || NULL_TOKENS.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        return None;
    }
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    let value = cleaned.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        None
    }
}

fn build_group(row: &SourceRow, specs: &[ColumnSpec]) -> MetricGroup {
    MetricGroup::from_pairs(
        specs.iter().map(|spec| (spec.field.clone(), coerce_metric(row.get(&spec.column)))),
    )
}

fn core_completeness(row: &SourceRow) -> f64 {
    let populated = CORE_METRIC_COLUMNS.iter()
        .filter(|column| coerce_metric(row.get(column)).is_some())
        .count();
    populated as f64 / CORE_METRIC_COLUMNS.len() as f64
}

fn missing_field(row: &SourceRow, metadata: &MetadataColumns, field: &str) -> PipelineError {
    PipelineError::DataValidation {
        message: format!("Missing required field: {}", field),
        field: Some(field.to_string()),
        value: None,
        context: ErrorContext {
            file_path: None,
            line_number: Some(row.line),
            column_name: Some(field.to_string()),
            trust_code: row.get(&metadata.trust_code).map(str::to_string),
            period: row.get(&metadata.period).map(str::to_string),
        },
    }
}
