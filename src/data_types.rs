/*!
 * Data type definitions for NHS trust performance records
 *
 * This module contains the nested record produced from one flat CSV row:
 * trust metadata plus RTT, A&E, diagnostics and capacity metric groups.
 */

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};


lazy_static! {
    /// 3-character ODS trust code
    pub static ref TRUST_CODE_PATTERN: Regex = Regex::new(r"^[A-Z0-9]{3}$").unwrap();
    /// ISO calendar date
    pub static ref PERIOD_PATTERN: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
}

/// Trust code - 3 character uppercase alphanumeric ODS identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrustCode(String);

impl TrustCode {
    /// Validate an already-normalized trust code
    pub fn parse(code: &str) -> Result<Self, crate::PipelineError> {
        if !TRUST_CODE_PATTERN.is_match(code) {
            return Err(crate::PipelineError::invalid_trust_code(code));
        }
        Ok(TrustCode(code.to_string()))
    }

    /// Uppercase first, then validate
    pub fn normalize(code: &str) -> Result<Self, crate::PipelineError> {
        Self::parse(&code.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrustCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reporting period (first day of the reporting month in NHS exports)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period(NaiveDate);

impl Period {
    /// Parse a `YYYY-MM-DD` period, rejecting impossible dates such as `2025-02-30`
    pub fn parse(value: &str) -> Result<Self, crate::PipelineError> {
        if !PERIOD_PATTERN.is_match(value) {
            return Err(crate::PipelineError::invalid_period(value, "does not match YYYY-MM-DD"));
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Period)
            .map_err(|_| crate::PipelineError::invalid_period(value, "not a valid calendar date"))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// How a metric value is range-checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Must lie in [0, 100]
    Percentage,
    /// Any non-negative quantity: counts, medians, capacities
    Count,
}

impl MetricKind {
    /// Classify a nested field name by naming convention
    pub fn classify(field: &str) -> Self {
        if field.contains("percent") || field.ends_with("_pct") || field.ends_with("occupancy_rate") {
            MetricKind::Percentage
        } else {
            MetricKind::Count
        }
    }

    /// Whether a value is within the allowed range for this kind
    pub fn in_range(&self, value: f64) -> bool {
        match self {
            MetricKind::Percentage => (0.0..=100.0).contains(&value),
            MetricKind::Count => value >= 0.0,
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Percentage => write!(f, "percentage"),
            MetricKind::Count => write!(f, "count"),
        }
    }
}

/// A group of named metrics; `None` marks a field that was mapped but had no value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricGroup(BTreeMap<String, Option<f64>>);

impl MetricGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a group from `(field, value)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<f64>)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Option<f64>) {
        self.0.insert(field.into(), value);
    }

    /// Value of a field, flattening "absent" and "null"
    pub fn get(&self, field: &str) -> Option<f64> {
        self.0.get(field).copied().flatten()
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Number of fields, populated or not
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of fields holding a value
    pub fn populated_count(&self) -> usize {
        self.0.values().filter(|v| v.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Referral-to-treatment data: trust-wide totals plus one group per specialty
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RttData {
    #[serde(default)]
    pub trust_total: MetricGroup,
    #[serde(default)]
    pub specialties: BTreeMap<String, MetricGroup>,
}

impl RttData {
    pub fn is_empty(&self) -> bool {
        self.trust_total.is_empty() && self.specialties.is_empty()
    }

    pub fn populated_count(&self) -> usize {
        self.trust_total.populated_count()
            + self.specialties.values().map(MetricGroup::populated_count).sum::<usize>()
    }
}

/// Diagnostics waiting data keyed by test type (e.g. `mri`, `computed_tomography`)
pub type DiagnosticsData = BTreeMap<String, MetricGroup>;

/// One NHS trust's performance metrics for one reporting period
///
/// The record keeps `trust_code` and `period` as plain strings so a malformed
/// record (for instance one read back from the store) can still be handed to
/// the validator. Records produced by the transformer always satisfy
/// [`TRUST_CODE_PATTERN`] and [`PERIOD_PATTERN`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrustPeriodRecord {
    pub trust_code: String,
    #[serde(default)]
    pub trust_name: Option<String>,
    pub period: String,
    #[serde(default)]
    pub icb_code: Option<String>,
    #[serde(default)]
    pub icb_name: Option<String>,
    #[serde(default)]
    pub rtt_data: Option<RttData>,
    #[serde(default)]
    pub ae_data: Option<MetricGroup>,
    #[serde(default)]
    pub diagnostics_data: Option<DiagnosticsData>,
    #[serde(default)]
    pub capacity_data: Option<MetricGroup>,
}

impl TrustPeriodRecord {
    /// The (trust_code, period) uniqueness key
    pub fn key(&self) -> RecordKey {
        RecordKey {
            trust_code: self.trust_code.clone(),
            period: self.period.clone(),
        }
    }

    /// Total number of populated metric values anywhere in the record
    pub fn populated_metric_count(&self) -> usize {
        let rtt = self.rtt_data.as_ref().map(RttData::populated_count).unwrap_or(0);
        let ae = self.ae_data.as_ref().map(MetricGroup::populated_count).unwrap_or(0);
        let diag = self.diagnostics_data.as_ref()
            .map(|d| d.values().map(MetricGroup::populated_count).sum::<usize>())
            .unwrap_or(0);
        let capacity = self.capacity_data.as_ref().map(MetricGroup::populated_count).unwrap_or(0);
        rtt + ae + diag + capacity
    }

    /// Whether the trust reported any A&E activity
    pub fn has_emergency_department(&self) -> bool {
        self.ae_data.as_ref().map(|ae| ae.populated_count() > 0).unwrap_or(false)
    }
}

/// Uniqueness key used as the upsert conflict target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub trust_code: String,
    pub period: String,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trust_code, self.period)
    }
}

/// One flat CSV row: column name to raw string value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    /// 1-based data line number (header excluded)
    pub line: usize,
    values: HashMap<String, String>,
}

impl SourceRow {
    pub fn new(line: usize, values: HashMap<String, String>) -> Self {
        Self { line, values }
    }

    /// Pair a CSV record with its header
    pub fn from_record(line: usize, headers: &csv::StringRecord, record: &csv::StringRecord) -> Self {
        let values = headers.iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim().to_string(), v.to_string()))
            .collect();
        Self { line, values }
    }

    /// Raw value of a column, trimmed; empty cells are `None`
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_code_parse() {
        assert!(TrustCode::parse("R0A").is_ok());
        assert!(TrustCode::parse("RJ1").is_ok());
        assert!(TrustCode::parse("xyz").is_err());
        assert!(TrustCode::parse("R0").is_err());
        assert!(TrustCode::parse("R0A1").is_err());
        assert_eq!(TrustCode::normalize(" xyz ").unwrap().as_str(), "XYZ");
    }

    #[test]
    fn test_period_parse() {
        assert_eq!(Period::parse("2025-01-01").unwrap().to_string(), "2025-01-01");
        assert!(Period::parse("2025-02-30").is_err());
        assert!(Period::parse("01/01/2025").is_err());
        assert!(Period::parse("2025-1-1").is_err());
    }

    #[test]
    fn test_metric_kind_classify() {
        assert_eq!(MetricKind::classify("percent_within_18_weeks"), MetricKind::Percentage);
        assert_eq!(MetricKind::classify("4hr_performance_pct"), MetricKind::Percentage);
        assert_eq!(MetricKind::classify("virtual_ward_occupancy_rate"), MetricKind::Percentage);
        assert_eq!(MetricKind::classify("median_wait_weeks"), MetricKind::Count);
        assert_eq!(MetricKind::classify("six_week_breaches"), MetricKind::Count);
        assert!(!MetricKind::Percentage.in_range(150.0));
        assert!(MetricKind::Count.in_range(150.0));
        assert!(!MetricKind::Count.in_range(-1.0));
    }

    #[test]
    fn test_metric_group_serializes_nulls() {
        let group = MetricGroup::from_pairs([("attendances_total", Some(10.0)), ("over_4hrs_total", None)]);
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["attendances_total"], serde_json::json!(10.0));
        assert!(json["over_4hrs_total"].is_null());
        assert_eq!(group.populated_count(), 1);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_record_deserializes_without_groups() {
        let record: TrustPeriodRecord = serde_json::from_str(
            r#"{"trust_code":"R0A","period":"2025-01-01"}"#
        ).unwrap();
        assert!(record.ae_data.is_none());
        assert_eq!(record.populated_metric_count(), 0);
        assert!(!record.has_emergency_department());
    }

    #[test]
    fn test_source_row_trims_and_drops_empty() {
        let mut values = HashMap::new();
        values.insert("trust_code".to_string(), " R0A ".to_string());
        values.insert("trust_name".to_string(), "   ".to_string());
        let row = SourceRow::new(1, values);
        assert_eq!(row.get("trust_code"), Some("R0A"));
        assert_eq!(row.get("trust_name"), None);
        assert_eq!(row.get("missing"), None);
    }
}
