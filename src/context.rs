/*!
 * Run-scoped statistics
 *
 * Counters for one pipeline run live in a [`RunContext`] that is passed
 * through the transformer, the validation chain and the uploader. Each run
 * owns its context, so runs over different files never share counters.
 */

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logging::LogContext;
use crate::validation::{ChainOutcome, ValidationMode};

/// Placeholder used when a rejected row has no usable key field
pub const UNKNOWN_KEY: &str = "UNKNOWN";

/// Pipeline stage at which a row was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Parse,
    Transform,
    Validation,
    Upload,
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStage::Parse => write!(f, "parse"),
            ErrorStage::Transform => write!(f, "transform"),
            ErrorStage::Validation => write!(f, "validation"),
            ErrorStage::Upload => write!(f, "upload"),
        }
    }
}

/// One rejected row with identifying context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub line: Option<usize>,
    pub trust_code: String,
    pub period: String,
    pub stage: ErrorStage,
    pub message: String,
}

impl RowError {
    pub fn new(
        line: Option<usize>,
        trust_code: Option<&str>,
        period: Option<&str>,
        stage: ErrorStage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            line,
            trust_code: trust_code.filter(|s| !s.is_empty()).unwrap_or(UNKNOWN_KEY).to_string(),
            period: period.filter(|s| !s.is_empty()).unwrap_or(UNKNOWN_KEY).to_string(),
            stage,
            message: message.into(),
        }
    }
}

/// Transform counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformStats {
    pub rows_read: usize,
    pub successful_transforms: usize,
    pub failed_transforms: usize,
    pub low_completeness_warnings: usize,
}

impl TransformStats {
    /// Successful transforms as a ratio of rows read
    pub fn success_rate(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.successful_transforms as f64 / self.rows_read as f64
        }
    }
}

/// Validation pass/fail counters accumulated across calls within a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub validated: usize,
    pub strict_passed: usize,
    pub permissive_passed: usize,
    pub rejected: usize,
    pub warnings: usize,
    completeness_sum: f64,
}

impl ValidationStats {
    /// Count one chain evaluation
    pub fn record(&mut self, outcome: &ChainOutcome) {
        self.validated += 1;
        match outcome.accepted_by {
            Some(ValidationMode::Strict) => self.strict_passed += 1,
            Some(ValidationMode::Permissive) => self.permissive_passed += 1,
            None => self.rejected += 1,
        }
        if let Some(result) = outcome.final_result() {
            self.warnings += result.warnings.len();
            self.completeness_sum += result.completeness;
        }
    }

    pub fn accepted(&self) -> usize {
        self.strict_passed + self.permissive_passed
    }

    /// Mean completeness over every validated record
    pub fn average_completeness(&self) -> f64 {
        if self.validated == 0 {
            0.0
        } else {
            self.completeness_sum / self.validated as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// How a batch ended up being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    Upsert,
    Insert,
    PerRecord,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::Upsert => write!(f, "upsert"),
            WriteStrategy::Insert => write!(f, "insert"),
            WriteStrategy::PerRecord => write!(f, "per-record insert"),
        }
    }
}

/// One flush of the upload buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushRecord {
    pub index: usize,
    pub size: usize,
    pub strategy: WriteStrategy,
    pub stored: usize,
    pub failed: usize,
}

/// Upload counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadStats {
    pub flushes: Vec<FlushRecord>,
    pub stored: usize,
    pub failed: usize,
    pub insert_fallbacks: usize,
    pub per_record_fallbacks: usize,
}

impl UploadStats {
    pub fn record_flush(&mut self, flush: FlushRecord) {
        self.stored += flush.stored;
        self.failed += flush.failed;
        match flush.strategy {
            WriteStrategy::Upsert => {}
            WriteStrategy::Insert => self.insert_fallbacks += 1,
            WriteStrategy::PerRecord => self.per_record_fallbacks += 1,
        }
        self.flushes.push(flush);
    }

    /// Batch sizes in flush order
    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flushes.iter().map(|f| f.size).collect()
    }
}

/// All mutable state of one pipeline run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub source: Option<PathBuf>,
    pub transform: TransformStats,
    pub validation: ValidationStats,
    pub upload: UploadStats,
    pub errors: Vec<RowError>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: format!("run-{}", &Uuid::new_v4().simple().to_string()[..8]),
            started_at: Utc::now(),
            source: None,
            transform: TransformStats::default(),
            validation: ValidationStats::default(),
            upload: UploadStats::default(),
            errors: Vec::new(),
        }
    }

    pub fn for_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new()
        }
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::new(&self.run_id)
    }

    pub fn push_error(&mut self, error: RowError) {
        log::warn!(
            "{} ROW_REJECTED stage={} trust_code={} period={} line={:?} reason={}",
            self.log_context(),
            error.stage,
            error.trust_code,
            error.period,
            error.line,
            error.message
        );
        self.errors.push(error);
    }

    /// Clear every counter, keeping the run id and source
    pub fn reset(&mut self) {
        self.transform = TransformStats::default();
        self.validation.reset();
        self.upload = UploadStats::default();
        self.errors.clear();
        self.started_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::TrustPeriodRecord;
    use crate::validation::ValidationChain;

    #[test]
    fn test_row_error_defaults_to_unknown() {
        let err = RowError::new(Some(3), None, Some(""), ErrorStage::Transform, "bad");
        assert_eq!(err.trust_code, UNKNOWN_KEY);
        assert_eq!(err.period, UNKNOWN_KEY);
    }

    #[test]
    fn test_validation_stats_reset() {
        let mut stats = ValidationStats::default();
        let record = TrustPeriodRecord {
            trust_code: "R0A".to_string(),
            period: "2025-01-01".to_string(),
            ..Default::default()
        };
        let outcome = ValidationChain::default().evaluate(&record);
        stats.record(&outcome);
        assert_eq!(stats.validated, 1);
        assert_eq!(stats.permissive_passed, 1);

        stats.reset();
        assert_eq!(stats, ValidationStats::default());
    }

    #[test]
    fn test_upload_stats_counts_fallbacks() {
        let mut stats = UploadStats::default();
        stats.record_flush(FlushRecord { index: 0, size: 100, strategy: WriteStrategy::Upsert, stored: 100, failed: 0 });
        stats.record_flush(FlushRecord { index: 1, size: 10, strategy: WriteStrategy::PerRecord, stored: 9, failed: 1 });
        assert_eq!(stats.stored, 109);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.per_record_fallbacks, 1);
        assert_eq!(stats.flush_sizes(), vec![100, 10]);
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut a = RunContext::new();
        let b = RunContext::new();
        a.transform.rows_read = 5;
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(b.transform.rows_read, 0);
        a.reset();
        assert_eq!(a.transform.rows_read, 0);
    }
}
