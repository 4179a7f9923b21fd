/*!
 * Error handling for the NHS metrics pipeline
 *
 * Provides detailed error types with context, suggestions, and recovery guidance.
 * Row-level problems are normally recovered inside the pipeline; the errors in
 * this module are what surfaces when recovery is not possible.
 */

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use serde::{Serialize, Deserialize};

use crate::store::{StoreError, StoreErrorCode};

/// Pipeline result type
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types with context and suggestions
#[derive(Error, Debug)]
pub enum PipelineError {
    /// File I/O errors with context
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    /// CSV parsing errors with location information
    #[error("CSV parsing error at line {line:?}: {message}")]
    CsvParse {
        message: String,
        line: Option<usize>,
        column: Option<String>,
        context: ErrorContext,
    },

    /// Data validation errors with detailed information
    #[error("Data validation error: {message}")]
    DataValidation {
        message: String,
        field: Option<String>,
        value: Option<String>,
        context: ErrorContext,
    },

    /// File not found with suggestions
    #[error("File not found: {path}")]
    FileNotFound {
        path: PathBuf,
        suggestion: String,
    },

    /// Invalid trust code with format guidance
    #[error("Invalid trust code '{code}': {reason}")]
    InvalidTrustCode {
        code: String,
        reason: String,
        suggestion: String,
    },

    /// Invalid reporting period with format guidance
    #[error("Invalid period '{value}': {reason}")]
    InvalidPeriod {
        value: String,
        reason: String,
        expected_format: String,
    },

    /// Required CSV columns are missing
    #[error("Schema mismatch: {message}")]
    SchemaMismatch {
        message: String,
        missing_columns: Vec<String>,
        found_columns: usize,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// Store credentials are not configured
    #[error("Missing store credentials: {missing}")]
    MissingCredentials {
        missing: String,
        suggestion: String,
    },

    /// Errors returned by the record store
    #[error("Store error ({code}): {message}")]
    Store {
        code: StoreErrorCode,
        message: String,
    },

    /// Export errors
    #[error("Export error: {message}")]
    Export {
        message: String,
        format: ExportFormat,
        suggestion: Option<String>,
    },
}

/// Error context providing additional information
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub line_number: Option<usize>,
    pub column_name: Option<String>,
    pub trust_code: Option<String>,
    pub period: Option<String>,
}

/// Export format for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    JsonLines,
    Sql,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "JSON"),
            ExportFormat::JsonLines => write!(f, "JSON Lines"),
            ExportFormat::Sql => write!(f, "SQL"),
        }
    }
}

impl PipelineError {
    /// Create a file not found error with helpful suggestion
    pub fn file_not_found_with_suggestion(path: PathBuf) -> Self {
        let name = path.to_string_lossy().to_lowercase();
        let suggestion = if name.ends_with(".csv") {
            format!(
                "Check if the CSV export exists at '{}'. The file must have a header row containing \
                trust_code, trust_name and period plus the trust_total_/rtt_/ae_/diag_/capacity_ metric columns.",
                path.display()
            )
        } else if name.ends_with(".json") && name.contains("mapping") {
            format!(
                "Check if the mapping file exists at '{}'. Generate one with `nhscli generate-mapping --csv <file>`.",
                path.display()
            )
        } else {
            format!(
                "Check if the file exists at '{}'. Make sure the path is correct and you have read permissions.",
                path.display()
            )
        };

        Self::FileNotFound { path, suggestion }
    }

    /// Create an invalid trust code error with validation details
    pub fn invalid_trust_code(code: &str) -> Self {
        let (reason, suggestion) = if code.is_empty() {
            ("trust code cannot be empty".to_string(),
             "Provide the 3-character ODS code of the trust, e.g. 'RJ1'".to_string())
        } else if code.chars().count() != 3 {
            (format!("trust code must be exactly 3 characters, found {}", code.chars().count()),
             "Trust codes are 3-character ODS codes; site codes (5 characters) are not accepted".to_string())
        } else if code.chars().any(|c| c.is_ascii_lowercase()) {
            ("trust code must be uppercase".to_string(),
             "Uppercase the code in the source export or enable normalize-then-validate ordering".to_string())
        } else {
            ("trust code must contain only letters A-Z and digits".to_string(),
             "Remove punctuation and whitespace from the trust code".to_string())
        };

        Self::InvalidTrustCode {
            code: code.to_string(),
            reason,
            suggestion,
        }
    }

    /// Create a period error with format information
    pub fn invalid_period(value: &str, reason: &str) -> Self {
        Self::InvalidPeriod {
            value: value.to_string(),
            reason: reason.to_string(),
            expected_format: "YYYY-MM-DD".to_string(),
        }
    }

    /// Create a schema mismatch error listing the missing columns
    pub fn missing_columns(missing_columns: Vec<String>, found_columns: usize) -> Self {
        let message = format!(
            "CSV header is missing {} required column(s): {}",
            missing_columns.len(),
            missing_columns.join(", ")
        );

        Self::SchemaMismatch {
            message,
            missing_columns,
            found_columns,
        }
    }

    /// Create a missing credentials error
    pub fn missing_credentials(missing: &str) -> Self {
        Self::MissingCredentials {
            missing: missing.to_string(),
            suggestion: "Set NHS_STORE_URL and NHS_STORE_KEY (or NHS_STORE_KEY_FILE), \
                or add a [store] section to the config file".to_string(),
        }
    }

    /// Whether this error aborts a run before any row is processed
    pub fn is_fatal_setup_error(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound { .. }
                | Self::SchemaMismatch { .. }
                | Self::MissingCredentials { .. }
                | Self::Configuration { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::FileNotFound { suggestion, .. } => {
                format!("{}\n\nSuggestion: {}", self, suggestion)
            }
            Self::InvalidTrustCode { suggestion, .. } => {
                format!("{}\n\nSuggestion: {}", self, suggestion)
            }
            Self::InvalidPeriod { expected_format, .. } => {
                format!("{}\n\nExpected format: {}", self, expected_format)
            }
            Self::SchemaMismatch { missing_columns, .. } => {
                format!("{}\n\nAdd the missing columns to the export: {}", self, missing_columns.join(", "))
            }
            Self::MissingCredentials { suggestion, .. } => {
                format!("{}\n\nSuggestion: {}", self, suggestion)
            }
            Self::Configuration { suggestion: Some(sug), .. }
            | Self::Export { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            _ => self.to_string(),
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
            context: ErrorContext::default(),
        }
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        let (line, message) = match err.position() {
            Some(pos) => (Some(pos.line() as usize), err.to_string()),
            None => (None, err.to_string()),
        };

        Self::CsvParse {
            message,
            line,
            column: None,
            context: ErrorContext::default(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Export {
            message: err.to_string(),
            format: ExportFormat::Json,
            suggestion: Some("Check if the data is serializable to JSON.".to_string()),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store {
            code: err.code,
            message: err.message,
        }
    }
}
