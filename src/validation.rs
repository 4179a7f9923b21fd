/*!
 * Record validation with strict and permissive policies
 *
 * Both policies reject records whose key fields are broken. They differ in
 * how they treat missing metric groups and out-of-range values: strict
 * raises errors, permissive downgrades the same findings to warnings. A
 * [`ValidationChain`] tries the policies in order and records which one
 * accepted the record.
 *
 * Every error raised in permissive mode is also raised in strict mode, so a
 * record accepted strictly is always accepted permissively.
 */

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::constants::{COMPLETENESS_WARNING_THRESHOLD, CROSS_FIELD_TOLERANCE, TRUST_NAME_MIN_LENGTH};
use crate::context::{ErrorStage, RowError, RunContext};
use crate::data_types::{MetricGroup, MetricKind, Period, TrustPeriodRecord, TRUST_CODE_PATTERN};

/// Validation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Strict,
    Permissive,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Strict => write!(f, "strict"),
            ValidationMode::Permissive => write!(f, "permissive"),
        }
    }
}

/// Outcome of validating one record under one policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub completeness: f64,
    pub mode: ValidationMode,
}

/// A consistency check between fields of one record
///
/// Checks only ever produce warnings.
pub trait CrossFieldCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, record: &TrustPeriodRecord) -> Vec<String>;
}

/// Specialty counts should add up to the trust total within a tolerance band
#[derive(Debug, Clone, Copy)]
pub struct SpecialtySumCheck {
    pub tolerance: f64,
}

impl CrossFieldCheck for SpecialtySumCheck {
    fn name(&self) -> &'static str {
        "specialty_sum"
    }

    fn check(&self, record: &TrustPeriodRecord) -> Vec<String> {
        let Some(rtt) = record.rtt_data.as_ref() else {
            return Vec::new();
        };
        let mut warnings = Vec::new();

        for (field, total) in rtt.trust_total.iter() {
            // only additive counts; percentages and medians do not sum
            if !field.starts_with("total_") {
                continue;
            }
            let Some(total) = total.filter(|t| *t > 0.0) else {
                continue;
            };
            let values: Vec<f64> = rtt.specialties.values().filter_map(|g| g.get(field)).collect();
            if values.is_empty() {
                continue;
            }
            let sum: f64 = values.iter().sum();
            let deviation = (sum - total).abs() / total;
            if deviation > self.tolerance {
                warnings.push(format!(
                    "Specialty sum of {} ({}) differs from trust total ({}) by {:.1}%",
                    field, sum, total, deviation * 100.0
                ));
            }
        }

        warnings
    }
}

/// Four-hour breaches cannot exceed attendances
#[derive(Debug, Clone, Copy, Default)]
pub struct EmergencyBreachCheck;

impl CrossFieldCheck for EmergencyBreachCheck {
    fn name(&self) -> &'static str {
        "emergency_breaches"
    }

    fn check(&self, record: &TrustPeriodRecord) -> Vec<String> {
        let Some(ae) = record.ae_data.as_ref() else {
            return Vec::new();
        };
        match (ae.get("over_4hrs_total"), ae.get("attendances_total")) {
            (Some(breaches), Some(attendances)) if breaches > attendances => vec![format!(
                "A&E over_4hrs_total ({}) exceeds attendances_total ({})",
                breaches, attendances
            )],
            _ => Vec::new(),
        }
    }
}

/// Validates trust-period records under a given policy
pub struct RecordValidator {
    completeness_threshold: f64,
    checks: Vec<Box<dyn CrossFieldCheck>>,
}

impl std::fmt::Debug for RecordValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordValidator")
            .field("completeness_threshold", &self.completeness_threshold)
            .field("checks", &self.checks.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for RecordValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordValidator {
    /// Validator without cross-field checks
    pub fn new() -> Self {
        Self {
            completeness_threshold: COMPLETENESS_WARNING_THRESHOLD,
            checks: Vec::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let validator = Self::new().with_completeness_threshold(config.completeness_threshold);
        if config.cross_field_checks {
            validator.with_default_checks(config.cross_field_tolerance)
        } else {
            validator
        }
    }

    pub fn with_completeness_threshold(mut self, threshold: f64) -> Self {
        self.completeness_threshold = threshold;
        self
    }

    /// Enable the specialty-sum and A&E breach checks
    pub fn with_default_checks(self, tolerance: f64) -> Self {
        self.with_check(SpecialtySumCheck { tolerance })
            .with_check(EmergencyBreachCheck)
    }

    pub fn with_check<C: CrossFieldCheck + 'static>(mut self, check: C) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Validate a record; has no side effects
    pub fn validate(&self, record: &TrustPeriodRecord, mode: ValidationMode) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // Key fields are errors under every policy
        let code = record.trust_code.trim();
        if code.is_empty() {
            errors.push("Missing trust_code".to_string());
        } else if !TRUST_CODE_PATTERN.is_match(code) {
            errors.push(format!("Invalid trust_code '{}': expected 3 uppercase letters or digits", code));
        }

        let period = record.period.trim();
        if period.is_empty() {
            errors.push("Missing period".to_string());
        } else if let Err(e) = Period::parse(period) {
            errors.push(e.to_string());
        }

        // Structural and range findings depend on the policy
        let mut issues = Vec::new();

        match record.rtt_data.as_ref().filter(|rtt| !rtt.is_empty()) {
            None => issues.push("Missing rtt_data".to_string()),
            Some(rtt) => {
                if rtt.populated_count() == 0 {
                    warnings.push("rtt_data has no populated values".to_string());
                }
                check_ranges("rtt_data.trust_total", &rtt.trust_total, &mut issues);
                for (specialty, group) in &rtt.specialties {
                    check_ranges(&format!("rtt_data.specialties.{}", specialty), group, &mut issues);
                }
            }
        }

        match record.ae_data.as_ref().filter(|ae| !ae.is_empty()) {
            None => issues.push("Missing ae_data".to_string()),
            Some(ae) => {
                if ae.populated_count() == 0 {
                    warnings.push("ae_data has no populated values".to_string());
                }
                check_ranges("ae_data", ae, &mut issues);
            }
        }

        match record.diagnostics_data.as_ref().filter(|d| d.values().any(|g| !g.is_empty())) {
            None => issues.push("Missing diagnostics_data".to_string()),
            Some(diagnostics) => {
                if diagnostics.values().all(|g| g.populated_count() == 0) {
                    warnings.push("diagnostics_data has no populated values".to_string());
                }
                for (test, group) in diagnostics {
                    check_ranges(&format!("diagnostics_data.{}", test), group, &mut issues);
                }
            }
        }

        match record.capacity_data.as_ref().filter(|c| !c.is_empty()) {
            None => issues.push("Missing capacity_data".to_string()),
            Some(capacity) => {
                if capacity.populated_count() == 0 {
                    warnings.push("capacity_data has no populated values".to_string());
                }
                check_ranges("capacity_data", capacity, &mut issues);
            }
        }

        match mode {
            ValidationMode::Strict => errors.extend(issues),
            ValidationMode::Permissive => warnings.extend(issues),
        }

        // Always warnings
        match record.trust_name.as_deref().map(str::trim) {
            None | Some("") => warnings.push("Missing trust_name".to_string()),
            Some(name) if name.chars().count() < TRUST_NAME_MIN_LENGTH => {
                warnings.push(format!("trust_name '{}' is shorter than {} characters", name, TRUST_NAME_MIN_LENGTH))
            }
            Some(_) => {}
        }

        if record.icb_code.as_deref().map(str::trim).unwrap_or("").is_empty() {
            warnings.push("Missing icb_code".to_string());
        }

        let completeness = completeness(record);
        if completeness < self.completeness_threshold {
            warnings.push(format!("Low data completeness: {:.0}%", completeness * 100.0));
        }

        for check in &self.checks {
            warnings.extend(check.check(record));
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            completeness,
            mode,
        }
    }
}

fn check_ranges(path: &str, group: &MetricGroup, issues: &mut Vec<String>) {
    for (field, value) in group.iter() {
        let Some(value) = value else { continue };
        let kind = MetricKind::classify(field);
        if !value.is_finite() {
            issues.push(format!("{}.{} is not a finite number", path, field));
        } else if !kind.in_range(value) {
            let range = match kind {
                MetricKind::Percentage => "[0, 100]",
                MetricKind::Count => ">= 0",
            };
            issues.push(format!("{}.{} = {} is outside {} ({})", path, field, value, range, kind));
        }
    }
}

/// Populated share of RTT trust totals, A&E and the first diagnostics test type
///
/// Returns 0.0 when none of those groups has any field.
pub fn completeness(record: &TrustPeriodRecord) -> f64 {
    let groups = [
        record.rtt_data.as_ref().map(|rtt| &rtt.trust_total),
        record.ae_data.as_ref(),
        record.diagnostics_data.as_ref().and_then(|d| d.values().next()),
    ];

    let (populated, total) = groups.iter()
        .flatten()
        .fold((0usize, 0usize), |(p, t), group| (p + group.populated_count(), t + group.len()));

    if total == 0 {
        0.0
    } else {
        populated as f64 / total as f64
    }
}

/// Result of running a record through the validation chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    /// The first policy that accepted, or `None` when every policy rejected
    pub accepted_by: Option<ValidationMode>,
    /// Every attempt in chain order
    pub attempts: Vec<ValidationResult>,
}

impl ChainOutcome {
    pub fn is_accepted(&self) -> bool {
        self.accepted_by.is_some()
    }

    /// The accepting attempt, or the last one tried
    pub fn final_result(&self) -> Option<&ValidationResult> {
        self.accepted_by
            .and_then(|mode| self.attempts.iter().find(|a| a.mode == mode))
            .or_else(|| self.attempts.last())
    }

    /// Warnings of the final attempt
    pub fn warnings(&self) -> &[String] {
        self.final_result().map(|r| r.warnings.as_slice()).unwrap_or(&[])
    }

    /// Errors of every attempt, prefixed with their policy
    pub fn rejection_reasons(&self) -> Vec<String> {
        self.attempts.iter()
            .flat_map(|a| a.errors.iter().map(move |e| format!("{}: {}", a.mode, e)))
            .collect()
    }
}

/// Ordered fallback of validation policies
#[derive(Debug)]
pub struct ValidationChain {
    modes: Vec<ValidationMode>,
    validator: RecordValidator,
}

impl Default for ValidationChain {
    fn default() -> Self {
        Self::new(vec![ValidationMode::Strict, ValidationMode::Permissive], RecordValidator::new())
    }
}

impl ValidationChain {
    /// An empty mode list falls back to strict then permissive
    pub fn new(modes: Vec<ValidationMode>, validator: RecordValidator) -> Self {
        let modes = if modes.is_empty() {
            vec![ValidationMode::Strict, ValidationMode::Permissive]
        } else {
            modes
        };
        Self { modes, validator }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.validation_chain.clone(), RecordValidator::from_config(config))
    }

    pub fn modes(&self) -> &[ValidationMode] {
        &self.modes
    }

    /// Try each policy in order until one accepts
    pub fn evaluate(&self, record: &TrustPeriodRecord) -> ChainOutcome {
        let mut attempts = Vec::with_capacity(self.modes.len());
        for mode in &self.modes {
            let result = self.validator.validate(record, *mode);
            let accepted = result.is_valid;
            attempts.push(result);
            if accepted {
                return ChainOutcome { accepted_by: Some(*mode), attempts };
            }
        }
        ChainOutcome { accepted_by: None, attempts }
    }

    /// Evaluate and count the outcome in the run context
    ///
    /// `line` is the source row, used to locate a rejection.
    pub fn evaluate_in(&self, record: &TrustPeriodRecord, line: Option<usize>, ctx: &mut RunContext) -> ChainOutcome {
        let outcome = self.evaluate(record);
        ctx.validation.record(&outcome);

        match outcome.accepted_by {
            Some(ValidationMode::Strict) => {}
            Some(mode) => log::debug!(
                "{} VALIDATION_FALLBACK key={} accepted_by={} warnings={}",
                ctx.log_context(),
                record.key(),
                mode,
                outcome.warnings().len()
            ),
            None => ctx.push_error(RowError::new(
                line,
                Some(record.trust_code.as_str()),
                Some(record.period.as_str()),
                ErrorStage::Validation,
                outcome.rejection_reasons().join("; "),
            )),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::RttData;
    use std::collections::BTreeMap;

    fn complete_record() -> TrustPeriodRecord {
        let mut specialties = BTreeMap::new();
        specialties.insert(
            "cardiology".to_string(),
            MetricGroup::from_pairs([("total_incomplete_pathways", Some(600.0)), ("percent_within_18_weeks", Some(60.0))]),
        );
        specialties.insert(
            "urology".to_string(),
            MetricGroup::from_pairs([("total_incomplete_pathways", Some(400.0)), ("percent_within_18_weeks", Some(55.0))]),
        );
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("mri".to_string(), MetricGroup::from_pairs([("total_waiting", Some(120.0))]));

        TrustPeriodRecord {
            trust_code: "R0A".to_string(),
            trust_name: Some("Manchester University NHS Foundation Trust".to_string()),
            period: "2025-01-01".to_string(),
            icb_code: Some("QOP".to_string()),
            icb_name: None,
            rtt_data: Some(RttData {
                trust_total: MetricGroup::from_pairs([
                    ("total_incomplete_pathways", Some(1000.0)),
                    ("percent_within_18_weeks", Some(58.0)),
                ]),
                specialties,
            }),
            ae_data: Some(MetricGroup::from_pairs([
                ("attendances_total", Some(5000.0)),
                ("over_4hrs_total", Some(1200.0)),
                ("4hr_performance_pct", Some(76.0)),
            ])),
            diagnostics_data: Some(diagnostics),
            capacity_data: Some(MetricGroup::from_pairs([("virtual_ward_capacity", Some(30.0))])),
        }
    }

    #[test]
    fn test_complete_record_passes_strict() {
        let result = RecordValidator::new().validate(&complete_record(), ValidationMode::Strict);
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.completeness, 1.0);
    }

    #[test]
    fn test_percentage_out_of_range() {
        let mut record = complete_record();
        record.rtt_data.as_mut().unwrap().trust_total.insert("percent_within_18_weeks", Some(150.0));

        let validator = RecordValidator::new();
        let strict = validator.validate(&record, ValidationMode::Strict);
        assert!(!strict.is_valid);
        assert!(strict.errors.iter().any(|e| e.contains("percent_within_18_weeks")));

        let permissive = validator.validate(&record, ValidationMode::Permissive);
        assert!(permissive.is_valid);
        assert!(permissive.warnings.iter().any(|w| w.contains("percent_within_18_weeks")));
    }

    #[test]
    fn test_missing_ae_data() {
        let mut record = complete_record();
        record.ae_data = None;

        let validator = RecordValidator::new();
        assert!(!validator.validate(&record, ValidationMode::Strict).is_valid);
        assert!(validator.validate(&record, ValidationMode::Permissive).is_valid);
    }

    #[test]
    fn test_metadata_errors_in_both_modes() {
        let mut record = complete_record();
        record.trust_code = "xyz".to_string();
        record.period = "2025-13-01".to_string();

        let validator = RecordValidator::new();
        for mode in [ValidationMode::Strict, ValidationMode::Permissive] {
            let result = validator.validate(&record, mode);
            assert!(!result.is_valid);
            assert_eq!(result.errors.len(), 2);
        }
    }

    #[test]
    fn test_metadata_only_record_is_permissive() {
        let record = TrustPeriodRecord {
            trust_code: "R0A".to_string(),
            period: "2025-01-01".to_string(),
            ..Default::default()
        };
        let result = RecordValidator::new().validate(&record, ValidationMode::Permissive);
        assert!(result.is_valid);
        assert_eq!(result.completeness, 0.0);
        assert!(result.warnings.iter().any(|w| w.contains("completeness")));
        assert!(result.warnings.iter().any(|w| w.contains("trust_name")));
        assert!(result.warnings.iter().any(|w| w.contains("icb_code")));
    }

    #[test]
    fn test_all_null_group_is_warning_only() {
        let mut record = complete_record();
        record.capacity_data = Some(MetricGroup::from_pairs([("virtual_ward_capacity", None)]));
        let result = RecordValidator::new().validate(&record, ValidationMode::Strict);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("capacity_data")));
    }

    #[test]
    fn test_strict_acceptance_implies_permissive() {
        let validator = RecordValidator::new();
        let mut records = vec![complete_record()];
        let mut broken = complete_record();
        broken.ae_data = Some(MetricGroup::from_pairs([("4hr_performance_pct", Some(-1.0))]));
        records.push(broken);
        records.push(TrustPeriodRecord::default());

        for record in &records {
            if validator.validate(record, ValidationMode::Strict).is_valid {
                assert!(validator.validate(record, ValidationMode::Permissive).is_valid);
            }
        }
    }

    #[test]
    fn test_cross_field_checks_disabled_by_default() {
        let mut record = complete_record();
        record.ae_data.as_mut().unwrap().insert("over_4hrs_total", Some(9000.0));
        record.rtt_data.as_mut().unwrap().trust_total.insert("total_incomplete_pathways", Some(5000.0));

        let plain = RecordValidator::new().validate(&record, ValidationMode::Strict);
        assert!(plain.warnings.is_empty());

        let checked = RecordValidator::new()
            .with_default_checks(CROSS_FIELD_TOLERANCE)
            .validate(&record, ValidationMode::Strict);
        assert!(checked.is_valid);
        assert_eq!(checked.warnings.len(), 2);
    }

    #[test]
    fn test_specialty_sum_within_tolerance() {
        let mut record = complete_record();
        // 1000 vs 1100 is a 10% deviation
        record.rtt_data.as_mut().unwrap().trust_total.insert("total_incomplete_pathways", Some(1100.0));
        let check = SpecialtySumCheck { tolerance: CROSS_FIELD_TOLERANCE };
        assert!(check.check(&record).is_empty());
    }

    #[test]
    fn test_chain_records_accepting_mode() {
        let chain = ValidationChain::default();
        assert_eq!(chain.evaluate(&complete_record()).accepted_by, Some(ValidationMode::Strict));

        let mut record = complete_record();
        record.diagnostics_data = None;
        let outcome = chain.evaluate(&record);
        assert_eq!(outcome.accepted_by, Some(ValidationMode::Permissive));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.final_result().unwrap().mode, ValidationMode::Permissive);

        record.trust_code = String::new();
        let outcome = chain.evaluate(&record);
        assert!(!outcome.is_accepted());
        assert!(outcome.rejection_reasons().iter().any(|r| r.starts_with("strict:")));
    }

    #[test]
    fn test_strict_only_chain_rejects_fallback_records() {
        let chain = ValidationChain::new(vec![ValidationMode::Strict], RecordValidator::new());
        let mut record = complete_record();
        record.ae_data = None;
        let mut ctx = RunContext::new();
        let outcome = chain.evaluate_in(&record, Some(7), &mut ctx);
        assert!(!outcome.is_accepted());
        assert_eq!(ctx.validation.rejected, 1);
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].line, Some(7));
        assert_eq!(ctx.errors[0].stage, ErrorStage::Validation);
    }
}
