//! Structured logging utilities.
//!
//! Every log line emitted during a run carries the run id, and the source
//! row when one is being processed, so lines from parallel runs can be
//! told apart.

use std::fmt;

/// Logging context for one pipeline run.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub row: Option<usize>,
}

impl LogContext {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            row: None,
        }
    }

    pub fn with_row(&self, row: usize) -> Self {
        Self {
            run_id: self.run_id.clone(),
            row: Some(row),
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "[run={}] [row={}]", self.run_id, row),
            None => write!(f, "[run={}]", self.run_id),
        }
    }
}

/// Initialize the process-wide logger.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` when verbose.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
