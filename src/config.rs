/*!
 * Configuration support for the NHS metrics pipeline
 *
 * Provides runtime configuration options for batch size, validation policy,
 * the record store backend and report output.
 */

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::constants::{
    COMPLETENESS_WARNING_THRESHOLD, CROSS_FIELD_TOLERANCE, DEFAULT_AUDIT_SAMPLE_SIZE,
    DEFAULT_BATCH_SIZE, DEFAULT_TABLE,
};
use crate::validation::ValidationMode;
use crate::PipelineError;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Accepted records per store write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Validation modes tried in order; the first that accepts wins
    #[serde(default = "default_validation_chain")]
    pub validation_chain: Vec<ValidationMode>,

    /// Whether trust codes are uppercased before or after pattern validation
    #[serde(default)]
    pub trust_code_order: TrustCodeOrder,

    /// Enable the specialty-sum and A&E breach checks (warnings only)
    #[serde(default)]
    pub cross_field_checks: bool,

    /// Relative tolerance of the specialty-sum check
    #[serde(default = "default_cross_field_tolerance")]
    pub cross_field_tolerance: f64,

    /// Completeness below this ratio is warned on
    #[serde(default = "default_completeness_threshold")]
    pub completeness_threshold: f64,

    /// Whether to show progress bars during long operations
    #[serde(default = "default_enable_progress_bar")]
    pub enable_progress_bar: bool,

    /// Directory receiving report artifacts
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Pre-generated column mapping; generated from the CSV header when unset
    #[serde(default)]
    pub mapping_path: Option<PathBuf>,

    /// Rows read back from the store for the JSONB audit
    #[serde(default = "default_audit_sample_size")]
    pub audit_sample_size: usize,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Order of trust code normalization and validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustCodeOrder {
    /// Validate the trimmed raw value, then uppercase; `xyz` is rejected
    #[default]
    ValidateThenNormalize,
    /// Uppercase first, then validate; `xyz` becomes `XYZ`
    NormalizeThenValidate,
}

impl std::str::FromStr for TrustCodeOrder {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "validate_then_normalize" | "validate" => Ok(TrustCodeOrder::ValidateThenNormalize),
            "normalize_then_validate" | "normalize" => Ok(TrustCodeOrder::NormalizeThenValidate),
            other => Err(PipelineError::Configuration {
                message: format!("Unknown trust code order: {}", other),
                suggestion: Some("Use validate_then_normalize or normalize_then_validate".to_string()),
            }),
        }
    }
}

/// Record store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process table, discarded at exit
    Memory,
    /// Local JSON file table
    #[default]
    File,
    /// Hosted PostgREST-compatible table API
    Rest,
}

impl std::str::FromStr for StoreBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" | "json" => Ok(StoreBackend::File),
            "rest" | "http" => Ok(StoreBackend::Rest),
            other => Err(PipelineError::Configuration {
                message: format!("Unknown store backend: {}", other),
                suggestion: Some("Use memory, file or rest".to_string()),
            }),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::File => write!(f, "file"),
            StoreBackend::Rest => write!(f, "rest"),
        }
    }
}

/// Where accepted records are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Base URL of the hosted store
    #[serde(default)]
    pub url: Option<String>,

    /// Service key; never written back by `save`
    #[serde(default, skip_serializing)]
    pub key: Option<String>,

    /// File holding the service key, read when `key` is unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_table")]
    pub table: String,

    /// Table file of the `file` backend
    #[serde(default = "default_store_file")]
    pub file_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key: None,
            key_file: None,
            table: default_table(),
            file_path: default_store_file(),
        }
    }
}

impl StoreConfig {
    /// Service key from `key`, falling back to the contents of `key_file`
    pub fn resolve_key(&self) -> Option<String> {
        if let Some(key) = self.key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.trim().to_string());
        }
        let path = self.key_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(contents) if !contents.trim().is_empty() => Some(contents.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Could not read store key file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// URL and key of the hosted store, or a fatal credentials error
    pub fn credentials(&self) -> crate::Result<(String, String)> {
        let url = self.url.as_ref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        let key = self.resolve_key();
        match (url, key) {
            (Some(url), Some(key)) => Ok((url, key)),
            (None, Some(_)) => Err(PipelineError::missing_credentials("NHS_STORE_URL")),
            (Some(_), None) => Err(PipelineError::missing_credentials("NHS_STORE_KEY")),
            (None, None) => Err(PipelineError::missing_credentials("NHS_STORE_URL, NHS_STORE_KEY")),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            validation_chain: default_validation_chain(),
            trust_code_order: TrustCodeOrder::default(),
            cross_field_checks: false,
            cross_field_tolerance: default_cross_field_tolerance(),
            completeness_threshold: default_completeness_threshold(),
            enable_progress_bar: default_enable_progress_bar(),
            report_dir: default_report_dir(),
            mapping_path: None,
            audit_sample_size: default_audit_sample_size(),
            store: StoreConfig::default(),
        }
    }
}

// Default value functions for serde
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_validation_chain() -> Vec<ValidationMode> {
    vec![ValidationMode::Strict, ValidationMode::Permissive]
}

fn default_cross_field_tolerance() -> f64 {
    CROSS_FIELD_TOLERANCE
}

fn default_completeness_threshold() -> f64 {
    COMPLETENESS_WARNING_THRESHOLD
}

fn default_enable_progress_bar() -> bool {
    true
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_audit_sample_size() -> usize {
    DEFAULT_AUDIT_SAMPLE_SIZE
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_store_file() -> PathBuf {
    PathBuf::from("trust_metrics.json")
}

/// Parse `strict,permissive` style chains; unknown names are skipped
fn parse_validation_chain(value: &str) -> Vec<ValidationMode> {
    value.split(',')
        .filter_map(|name| match name.trim().to_lowercase().as_str() {
            "strict" => Some(ValidationMode::Strict),
            "permissive" => Some(ValidationMode::Permissive),
            "" => None,
            other => {
                log::warn!("Ignoring unknown validation mode in NHS_VALIDATION_CHAIN: {}", other);
                None
            }
        })
        .collect()
}

impl PipelineConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - `NHS_BATCH_SIZE`: number
    /// - `NHS_VALIDATION_CHAIN`: comma separated modes, e.g. "strict,permissive"
    /// - `NHS_TRUST_CODE_ORDER`: "validate_then_normalize" or "normalize_then_validate"
    /// - `NHS_CROSS_FIELD_CHECKS`: "true" or "false"
    /// - `NHS_PROGRESS_BAR`: "true" or "false"
    /// - `NHS_REPORT_DIR`: directory path
    /// - `NHS_MAPPING_PATH`: mapping JSON path
    /// - `NHS_STORE_BACKEND`: "memory", "file" or "rest"
    /// - `NHS_STORE_URL`, `NHS_STORE_KEY`, `NHS_STORE_KEY_FILE`, `NHS_STORE_TABLE`
    /// - `NHS_STORE_FILE`: table file of the file backend
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply any `NHS_*` environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("NHS_BATCH_SIZE") {
            match val.parse::<usize>() {
                Ok(size) if size > 0 => self.batch_size = size,
                _ => log::warn!("Ignoring invalid NHS_BATCH_SIZE: {}", val),
            }
        }

        if let Ok(val) = std::env::var("NHS_VALIDATION_CHAIN") {
            let chain = parse_validation_chain(&val);
            if !chain.is_empty() {
                self.validation_chain = chain;
            }
        }

        if let Ok(val) = std::env::var("NHS_TRUST_CODE_ORDER") {
            match val.parse() {
                Ok(order) => self.trust_code_order = order,
                Err(e) => log::warn!("{}", e),
            }
        }

        if let Ok(val) = std::env::var("NHS_CROSS_FIELD_CHECKS") {
            self.cross_field_checks = val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("NHS_PROGRESS_BAR") {
            self.enable_progress_bar = val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("NHS_REPORT_DIR") {
            self.report_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("NHS_MAPPING_PATH") {
            self.mapping_path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("NHS_STORE_BACKEND") {
            match val.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => log::warn!("{}", e),
            }
        }

        if let Ok(val) = std::env::var("NHS_STORE_URL") {
            self.store.url = Some(val);
        }

        if let Ok(val) = std::env::var("NHS_STORE_KEY") {
            self.store.key = Some(val);
        }

        if let Ok(val) = std::env::var("NHS_STORE_KEY_FILE") {
            self.store.key_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("NHS_STORE_TABLE") {
            self.store.table = val;
        }

        if let Ok(val) = std::env::var("NHS_STORE_FILE") {
            self.store.file_path = PathBuf::from(val);
        }

        self
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| PipelineError::Configuration {
                message: format!("Failed to parse config file: {}", e),
                suggestion: Some("Check that the file is valid TOML format".to_string()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration {
                message: format!("Failed to serialize config: {}", e),
                suggestion: None,
            })?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration {
                message: "batch_size must be at least 1".to_string(),
                suggestion: Some(format!("The default is {}", DEFAULT_BATCH_SIZE)),
            });
        }
        if self.validation_chain.is_empty() {
            return Err(PipelineError::Configuration {
                message: "validation_chain must name at least one mode".to_string(),
                suggestion: Some("Use [\"strict\", \"permissive\"]".to_string()),
            });
        }
        if !(0.0..=1.0).contains(&self.completeness_threshold) {
            return Err(PipelineError::Configuration {
                message: format!("completeness_threshold {} is not a ratio", self.completeness_threshold),
                suggestion: Some("Use a value between 0.0 and 1.0".to_string()),
            });
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/nhs-metrics/config.toml` on Unix-like systems
    /// or `%APPDATA%\nhs-metrics\config.toml` on Windows
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "nhs-metrics")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location with environment overrides
    ///
    /// Priority order:
    /// 1. Environment variables
    /// 2. Default config file (if exists)
    /// 3. Built-in defaults
    pub fn load() -> Self {
        let base = Self::default_config_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::from_file(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("Ignoring config file {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();

        base.with_env_overrides()
    }

    /// Strict validation only; anything short of strict is rejected
    pub fn strict_only() -> Self {
        Self {
            validation_chain: vec![ValidationMode::Strict],
            cross_field_checks: true,
            ..Self::default()
        }
    }

    /// Permissive validation only, no progress output
    pub fn permissive() -> Self {
        Self {
            validation_chain: vec![ValidationMode::Permissive],
            trust_code_order: TrustCodeOrder::NormalizeThenValidate,
            enable_progress_bar: false,
            ..Self::default()
        }
    }
}

/// Builder for customizing configuration
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Start building a new configuration
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Set batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the validation chain
    pub fn validation_chain(mut self, modes: Vec<ValidationMode>) -> Self {
        self.config.validation_chain = modes;
        self
    }

    /// Set trust code normalization order
    pub fn trust_code_order(mut self, order: TrustCodeOrder) -> Self {
        self.config.trust_code_order = order;
        self
    }

    /// Enable cross-field consistency warnings
    pub fn cross_field_checks(mut self, enabled: bool) -> Self {
        self.config.cross_field_checks = enabled;
        self
    }

    pub fn completeness_threshold(mut self, threshold: f64) -> Self {
        self.config.completeness_threshold = threshold;
        self
    }

    /// Set progress bar enabled
    pub fn progress_bar(mut self, enabled: bool) -> Self {
        self.config.enable_progress_bar = enabled;
        self
    }

    /// Set report directory
    pub fn report_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.report_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Use a pre-generated column mapping
    pub fn mapping_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.mapping_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn audit_sample_size(mut self, size: usize) -> Self {
        self.config.audit_sample_size = size;
        self
    }

    /// Set the store configuration
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Build the configuration
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
