/*!
 * Batch upload pipeline
 *
 * One run streams a CSV export through the row transformer and the
 * validation chain, buffers accepted records and writes them to the store
 * in batches:
 *
 * 1. upsert keyed on `(trust_code, period)`
 * 2. plain insert when the store has no unique constraint for the upsert
 * 3. one write per record when the batch write still fails
 *
 * Row-level failures are counted and reported; only setup problems (missing
 * file, missing required columns, unreadable mapping) end a run early.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::constants::CONFLICT_TARGET;
use crate::context::{ErrorStage, FlushRecord, RowError, RunContext, WriteStrategy};
use crate::data_types::TrustPeriodRecord;
use crate::reader::CsvSource;
use crate::report::{HeaderCheck, JsonbAudit, PipelineReport};
use crate::schema::{ColumnMapping, TrustMetricsSchema};
use crate::store::{RecordStore, StoreErrorCode};
use crate::transform::RowTransformer;
use crate::validation::{ValidationChain, ValidationMode};
use crate::{PipelineError, Result};

/// A record that passed validation, with the policy that accepted it
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRecord {
    pub record: TrustPeriodRecord,
    pub accepted_by: ValidationMode,
    pub warnings: Vec<String>,
}

/// Report plus, when requested, every accepted record
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: PipelineReport,
    pub accepted: Vec<AcceptedRecord>,
}

/// CSV to store pipeline
pub struct BatchUploadPipeline {
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
    chain: ValidationChain,
    keep_accepted: bool,
}

impl BatchUploadPipeline {
    pub fn new(store: Arc<dyn RecordStore>, config: PipelineConfig) -> Self {
        let chain = ValidationChain::from_config(&config);
        Self {
            store,
            config,
            chain,
            keep_accepted: false,
        }
    }

    /// Keep accepted records in the run outcome, e.g. for export
    pub fn keep_accepted(mut self, keep: bool) -> Self {
        self.keep_accepted = keep;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Process one CSV file
    pub fn run<P: AsRef<Path>>(&self, path: P) -> Result<PipelineReport> {
        Ok(self.run_detailed(path)?.report)
    }

    /// Process one CSV file, returning accepted records when `keep_accepted` is set
    pub fn run_detailed<P: AsRef<Path>>(&self, path: P) -> Result<RunOutcome> {
        let path = path.as_ref();
        self.config.validate()?;

        let mut ctx = RunContext::for_source(path);
        let log_ctx = ctx.log_context();
        log::info!("{} RUN_STARTED source={} store={}", log_ctx, path.display(), self.store.name());

        let mut source = CsvSource::open(path)?.with_progress_bar(self.config.enable_progress_bar);
        let headers = source.headers();

        let missing = TrustMetricsSchema::missing_required_columns(&headers);
        let header_check = HeaderCheck {
            passed: missing.is_empty(),
            found_columns: headers.len(),
            missing_columns: missing.clone(),
        };
        if !missing.is_empty() {
            let error = PipelineError::missing_columns(missing, headers.len());
            log::error!("{} HEADER_CHECK_FAILED {}", log_ctx, error);
            let report = PipelineReport::aborted(
                &ctx,
                self.store.name(),
                self.config.batch_size,
                header_check,
                format!("Header validation failed: {}", error),
            );
            return Ok(RunOutcome { report, accepted: Vec::new() });
        }

        let mapping = self.resolve_mapping(&headers, &ctx)?;
        let transformer = RowTransformer::with_options(mapping, (&self.config).into());

        let mut uploader = BatchUploader::new(self.store.as_ref(), self.config.batch_size);
        let mut accepted = Vec::new();

        for row in source.by_ref() {
            ctx.transform.rows_read += 1;
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    ctx.transform.failed_transforms += 1;
                    let line = match &e {
                        PipelineError::CsvParse { line, .. } => *line,
                        _ => None,
                    };
                    ctx.push_error(RowError::new(line, None, None, ErrorStage::Parse, e.to_string()));
                    continue;
                }
            };

            let Some(record) = transformer.transform(&row, &mut ctx) else {
                continue;
            };

            let outcome = self.chain.evaluate_in(&record, Some(row.line), &mut ctx);
            let Some(mode) = outcome.accepted_by else {
                continue;
            };

            if self.keep_accepted {
                accepted.push(AcceptedRecord {
                    record: record.clone(),
                    accepted_by: mode,
                    warnings: outcome.warnings().to_vec(),
                });
            }
            uploader.push(record, &mut ctx);
        }
        let rows_per_second = source.rows_per_second();
        uploader.finish(&mut ctx);

        let audit = match self.store.sample(self.config.audit_sample_size) {
            Ok(rows) => JsonbAudit::from_rows(&rows),
            Err(e) => {
                log::warn!("{} JSONB_AUDIT_FAILED {}", log_ctx, e);
                JsonbAudit::failed(e.to_string())
            }
        };

        let report = PipelineReport::completed(&ctx, self.store.name(), self.config.batch_size, header_check, audit);
        log::info!(
            "{} RUN_COMPLETED processed={} stored={} failed_transforms={} rejected={} upload_failures={} rows_per_sec={:.1} duration_secs={:.2}",
            log_ctx,
            report.processed_rows(),
            report.upload.stored,
            report.transform.failed_transforms,
            report.validation.rejected,
            report.upload.failed,
            rows_per_second,
            report.duration_secs
        );

        Ok(RunOutcome { report, accepted })
    }

    /// Process several files, each with its own run context
    ///
    /// Runs share the store; results come back in input order.
    pub fn run_many(&self, paths: &[PathBuf]) -> Vec<Result<PipelineReport>> {
        #[cfg(feature = "parallel")]
        {
            paths.par_iter().map(|path| self.run(path)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            paths.iter().map(|path| self.run(path)).collect()
        }
    }

    fn resolve_mapping(&self, headers: &[String], ctx: &RunContext) -> Result<ColumnMapping> {
        match &self.config.mapping_path {
            Some(path) => {
                let mapping = ColumnMapping::load(path)?;
                log::info!("{} MAPPING_LOADED path={} {}", ctx.log_context(), path.display(), mapping.summary());
                Ok(mapping)
            }
            None => {
                let mapping = ColumnMapping::from_headers(headers);
                log::info!("{} MAPPING_GENERATED {}", ctx.log_context(), mapping.summary());
                Ok(mapping)
            }
        }
    }
}

/// Buffers accepted records and writes them in serial batches
struct BatchUploader<'a> {
    store: &'a dyn RecordStore,
    batch_size: usize,
    buffer: Vec<TrustPeriodRecord>,
}

impl<'a> BatchUploader<'a> {
    fn new(store: &'a dyn RecordStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            buffer: Vec::with_capacity(batch_size.max(1)),
        }
    }

    fn push(&mut self, record: TrustPeriodRecord, ctx: &mut RunContext) {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush(ctx);
        }
    }

    fn finish(mut self, ctx: &mut RunContext) {
        if !self.buffer.is_empty() {
            self.flush(ctx);
        }
    }

    fn flush(&mut self, ctx: &mut RunContext) {
        let batch = std::mem::take(&mut self.buffer);
        let index = ctx.upload.flushes.len();
        let log_ctx = ctx.log_context();

        let flush = match self.store.upsert(&batch, CONFLICT_TARGET) {
            Ok(stored) => FlushRecord { index, size: batch.len(), strategy: WriteStrategy::Upsert, stored, failed: 0 },
            Err(e) if e.code == StoreErrorCode::ConflictTargetMissing => {
                log::warn!("{} UPSERT_UNSUPPORTED batch={} falling back to insert: {}", log_ctx, index, e);
                match self.store.insert(&batch) {
                    Ok(stored) => FlushRecord { index, size: batch.len(), strategy: WriteStrategy::Insert, stored, failed: 0 },
                    Err(e) => {
                        log::warn!("{} INSERT_FAILED batch={} writing records one by one: {}", log_ctx, index, e);
                        self.write_each(&batch, index, false, ctx)
                    }
                }
            }
            Err(e) => {
                log::warn!("{} UPSERT_FAILED batch={} writing records one by one: {}", log_ctx, index, e);
                self.write_each(&batch, index, true, ctx)
            }
        };

        log::info!(
            "{} BATCH_FLUSHED batch={} size={} write={} stored={} failed={}",
            log_ctx, flush.index, flush.size, flush.strategy, flush.stored, flush.failed
        );
        ctx.upload.record_flush(flush);
    }

    /// Per-record fallback; keeps upsert semantics when the store supports them
    fn write_each(&self, batch: &[TrustPeriodRecord], index: usize, upsert: bool, ctx: &mut RunContext) -> FlushRecord {
        let mut stored = 0;
        let mut failed = 0;

        for record in batch {
            let single = std::slice::from_ref(record);
            let result = if upsert {
                self.store.upsert(single, CONFLICT_TARGET)
            } else {
                self.store.insert(single)
            };
            match result {
                Ok(n) => stored += n,
                Err(e) => {
                    failed += 1;
                    ctx.push_error(RowError::new(
                        None,
                        Some(record.trust_code.as_str()),
                        Some(record.period.as_str()),
                        ErrorStage::Upload,
                        e.to_string(),
                    ));
                }
            }
        }

        FlushRecord { index, size: batch.len(), strategy: WriteStrategy::PerRecord, stored, failed }
    }
}
