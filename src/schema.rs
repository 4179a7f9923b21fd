/*!
 * Column mapping for NHS trust performance CSV exports
 *
 * The export is one wide row per trust and period. This module describes
 * which flat columns make up each nested field group of a
 * [`TrustPeriodRecord`](crate::data_types::TrustPeriodRecord) and how a
 * column name is stripped down to its nested field name:
 *
 * | column | nested field |
 * |---|---|
 * | `trust_total_<metric>` | `rtt_data.trust_total.<metric>` |
 * | `rtt_<specialty>_<metric>` | `rtt_data.specialties.<specialty>.<metric>` |
 * | `ae_<metric>` | `ae_data.<metric>` |
 * | `diag_<test type>_<metric>` | `diagnostics_data.<test type>.<metric>` |
 * | `capacity_<metric>` | `capacity_data.<metric>` |
 *
 * Generating the mapping from a header row is an offline step; the
 * resulting JSON document is loaded by the pipeline as configuration.
 */

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::data_types::MetricKind;
use crate::{PipelineError, Result};

/// Current mapping document format
pub const MAPPING_FORMAT_VERSION: u32 = 1;

/// One source column and the nested field it fills
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column: String,
    pub field: String,
    pub kind: MetricKind,
}

impl ColumnSpec {
    pub fn new(column: impl Into<String>, field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            column: column.into(),
            kind: MetricKind::classify(&field),
            field,
        }
    }
}

/// Names of the non-metric columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataColumns {
    pub trust_code: String,
    pub trust_name: String,
    pub period: String,
    pub icb_code: String,
    pub icb_name: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            trust_code: "trust_code".to_string(),
            trust_name: "trust_name".to_string(),
            period: "period".to_string(),
            icb_code: "icb_code".to_string(),
            icb_name: "icb_name".to_string(),
        }
    }
}

impl MetadataColumns {
    fn contains(&self, column: &str) -> bool {
        [&self.trust_code, &self.trust_name, &self.period, &self.icb_code, &self.icb_name]
            .iter()
            .any(|c| c.as_str() == column)
    }
}

/// Result of classifying a single header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnClass {
    Metadata,
    TrustTotal(ColumnSpec),
    Specialty(String, ColumnSpec),
    Emergency(ColumnSpec),
    Diagnostic(String, ColumnSpec),
    Capacity(ColumnSpec),
    Unmapped,
}

/// Declarative transformation strategy: which columns feed which nested field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub version: u32,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_column_count: usize,
    #[serde(default)]
    pub metadata: MetadataColumns,
    #[serde(default)]
    pub rtt_trust_total: Vec<ColumnSpec>,
    #[serde(default)]
    pub rtt_specialties: BTreeMap<String, Vec<ColumnSpec>>,
    #[serde(default)]
    pub ae: Vec<ColumnSpec>,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, Vec<ColumnSpec>>,
    #[serde(default)]
    pub capacity: Vec<ColumnSpec>,
    #[serde(default)]
    pub unmapped: Vec<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            version: MAPPING_FORMAT_VERSION,
            generated_at: None,
            source_column_count: 0,
            metadata: MetadataColumns::default(),
            rtt_trust_total: Vec::new(),
            rtt_specialties: BTreeMap::new(),
            ae: Vec::new(),
            diagnostics: BTreeMap::new(),
            capacity: Vec::new(),
            unmapped: Vec::new(),
        }
    }
}

impl ColumnMapping {
    /// Generate a mapping by classifying every header by naming convention
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut mapping = ColumnMapping {
            generated_at: Some(Utc::now()),
            source_column_count: headers.len(),
            ..Default::default()
        };

        for header in headers {
            let column = header.as_ref().trim();
            if column.is_empty() {
                continue;
            }
            match classify_column(column, &mapping.metadata) {
                ColumnClass::Metadata => {}
                ColumnClass::TrustTotal(spec) => mapping.rtt_trust_total.push(spec),
                ColumnClass::Specialty(name, spec) => {
                    mapping.rtt_specialties.entry(name).or_default().push(spec)
                }
                ColumnClass::Emergency(spec) => mapping.ae.push(spec),
                ColumnClass::Diagnostic(test, spec) => {
                    mapping.diagnostics.entry(test).or_default().push(spec)
                }
                ColumnClass::Capacity(spec) => mapping.capacity.push(spec),
                ColumnClass::Unmapped => mapping.unmapped.push(column.to_string()),
            }
        }

        log::debug!(
            "MAPPING_GENERATED columns={} mapped={} unmapped={}",
            mapping.source_column_count,
            mapping.mapped_column_count(),
            mapping.unmapped.len()
        );

        mapping
    }

    /// The mapping for the standard export layout
    pub fn standard() -> Self {
        Self::from_headers(&TrustMetricsSchema::standard_headers())
    }

    /// Load a mapping document from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::file_not_found_with_suggestion(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let mapping: ColumnMapping = serde_json::from_str(&contents)
            .map_err(|e| PipelineError::Configuration {
                message: format!("Failed to parse mapping file {}: {}", path.display(), e),
                suggestion: Some("Regenerate the mapping with `nhscli generate-mapping`".to_string()),
            })?;
        if mapping.version != MAPPING_FORMAT_VERSION {
            return Err(PipelineError::Configuration {
                message: format!(
                    "Unsupported mapping version {} (expected {})",
                    mapping.version, MAPPING_FORMAT_VERSION
                ),
                suggestion: Some("Regenerate the mapping with `nhscli generate-mapping`".to_string()),
            });
        }
        Ok(mapping)
    }

    /// Save the mapping document as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Number of metric columns that feed a nested field
    pub fn mapped_column_count(&self) -> usize {
        self.rtt_trust_total.len()
            + self.rtt_specialties.values().map(Vec::len).sum::<usize>()
            + self.ae.len()
            + self.diagnostics.values().map(Vec::len).sum::<usize>()
            + self.capacity.len()
    }

    /// One-line description for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} trust-total, {} specialties, {} A&E, {} diagnostic test types, {} capacity, {} unmapped",
            self.rtt_trust_total.len(),
            self.rtt_specialties.len(),
            self.ae.len(),
            self.diagnostics.len(),
            self.capacity.len(),
            self.unmapped.len()
        )
    }
}

/// Classify one header into its field group
pub fn classify_column(column: &str, metadata: &MetadataColumns) -> ColumnClass {
    if metadata.contains(column) {
        return ColumnClass::Metadata;
    }

    let lower = column.to_ascii_lowercase();

    if let Some(metric) = lower.strip_prefix(TRUST_TOTAL_PREFIX) {
        if !metric.is_empty() {
            return ColumnClass::TrustTotal(ColumnSpec::new(column, metric));
        }
    } else if let Some(rest) = lower.strip_prefix(RTT_PREFIX) {
        if let Some((specialty, metric)) = split_known_suffix(rest, RTT_METRICS) {
            return ColumnClass::Specialty(specialty.to_string(), ColumnSpec::new(column, metric));
        }
    } else if let Some(metric) = lower.strip_prefix(AE_PREFIX) {
        if !metric.is_empty() {
            return ColumnClass::Emergency(ColumnSpec::new(column, metric));
        }
    } else if let Some(rest) = lower.strip_prefix(DIAGNOSTICS_PREFIX) {
        if let Some((test, metric)) = split_known_suffix(rest, DIAGNOSTIC_METRICS) {
            return ColumnClass::Diagnostic(test.to_string(), ColumnSpec::new(column, metric));
        }
    } else if let Some(metric) = lower.strip_prefix(CAPACITY_PREFIX) {
        if !metric.is_empty() {
            return ColumnClass::Capacity(ColumnSpec::new(column, metric));
        }
    }

    ColumnClass::Unmapped
}

/// Split `<group>_<metric>` where the group name may itself contain underscores
fn split_known_suffix<'a>(rest: &'a str, metrics: &[&'a str]) -> Option<(&'a str, &'a str)> {
    let mut candidates: Vec<&str> = metrics.to_vec();
    // longest first so `total_over_18_weeks` never matches as `18_weeks`-style fragments
    candidates.sort_by_key(|m| std::cmp::Reverse(m.len()));

    candidates.into_iter().find_map(|metric| {
        let group = rest.strip_suffix(metric)?.strip_suffix('_')?;
        if group.is_empty() {
            None
        } else {
            Some((group, metric))
        }
    })
}

/// Header layout of the trust metrics export
pub struct TrustMetricsSchema;

impl TrustMetricsSchema {
    /// Columns that must be present for a run to start
    pub fn required_columns() -> Vec<&'static str> {
        REQUIRED_COLUMNS.to_vec()
    }

    /// Required columns absent from the header, in declaration order
    pub fn missing_required_columns<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
        REQUIRED_COLUMNS.iter()
            .filter(|required| !headers.iter().any(|h| h.as_ref().trim() == **required))
            .map(|c| c.to_string())
            .collect()
    }

    /// Validate that a header row contains every required column
    pub fn validate_headers<S: AsRef<str>>(headers: &[S]) -> Result<()> {
        let missing = Self::missing_required_columns(headers);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::missing_columns(missing, headers.len()))
        }
    }

    /// Every column of the standard export, metadata first
    pub fn standard_headers() -> Vec<String> {
        let mut columns: Vec<String> = ["trust_code", "trust_name", "period", "icb_code", "icb_name"]
            .iter()
            .map(|c| c.to_string())
            .collect();

        columns.extend(RTT_METRICS.iter().map(|m| format!("{}{}", TRUST_TOTAL_PREFIX, m)));

        for specialty in RTT_SPECIALTIES {
            columns.extend(RTT_METRICS.iter().map(|m| format!("{}{}_{}", RTT_PREFIX, specialty, m)));
        }

        columns.extend(AE_METRICS.iter().map(|m| format!("{}{}", AE_PREFIX, m)));

        for test in DIAGNOSTIC_TEST_TYPES {
            columns.extend(DIAGNOSTIC_METRICS.iter().map(|m| format!("{}{}_{}", DIAGNOSTICS_PREFIX, test, m)));
        }

        columns.extend(CAPACITY_METRICS.iter().map(|m| format!("{}{}", CAPACITY_PREFIX, m)));

        columns
    }
}
