/*!
 * Keyed table stores for trust-period records
 *
 * The pipeline writes through the [`RecordStore`] trait. Every store keeps
 * one row per `(trust_code, period)` when it has a unique constraint on that
 * pair; upserts overwrite, so replaying a file is idempotent. Each batch call
 * is atomic: it either writes every record or none.
 */

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::config::{StoreBackend, StoreConfig};
use crate::constants::CONFLICT_TARGET;
use crate::data_types::{RecordKey, TrustPeriodRecord};
use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StoreErrorCode {
    /// No unique constraint matches the upsert conflict target
    ConflictTargetMissing,
    /// A unique constraint was violated
    Conflict,
    Validation,
    Network,
    Unauthorized,
    Io,
    Internal,
}

impl StoreErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConflictTargetMissing => "conflict_target_missing",
            Self::Conflict => "conflict",
            Self::Validation => "validation_error",
            Self::Network => "network_error",
            Self::Unauthorized => "unauthorized",
            Self::Io => "io_error",
            Self::Internal => "internal_error",
        }
    }
}

impl Display for StoreErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for StoreError {}

/// A table of trust-period records
pub trait RecordStore: Send + Sync {
    /// Backend name for logs and reports
    fn name(&self) -> &str;

    /// Insert or overwrite records keyed on `conflict_target`
    fn upsert(&self, records: &[TrustPeriodRecord], conflict_target: &[&str]) -> Result<usize, StoreError>;

    /// Plain insert with no conflict handling
    fn insert(&self, records: &[TrustPeriodRecord]) -> Result<usize, StoreError>;

    /// Up to `limit` stored rows as the store returns them
    fn sample(&self, limit: usize) -> Result<Vec<serde_json::Value>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

/// Write operation seen by a [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Upsert,
    Insert,
}

/// One entry of the [`MemoryStore`] operation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub kind: OperationKind,
    pub size: usize,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<TrustPeriodRecord>,
    /// First row holding each key
    index: HashMap<RecordKey, usize>,
    operations: Vec<StoreOperation>,
}

impl Table {
    fn with_rows(rows: Vec<TrustPeriodRecord>) -> Self {
        let mut table = Self::default();
        table.replace_rows(rows);
        table
    }

    fn position(&self, key: &RecordKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn push(&mut self, record: TrustPeriodRecord) {
        self.index.entry(record.key()).or_insert(self.rows.len());
        self.rows.push(record);
    }

    fn replace_rows(&mut self, rows: Vec<TrustPeriodRecord>) {
        self.rows = Vec::with_capacity(rows.len());
        self.index.clear();
        for record in rows {
            self.push(record);
        }
    }
}

/// Runs after a write is applied, with the lock still held; an error undoes the write
type CommitHook<'a> = &'a dyn Fn(&[TrustPeriodRecord]) -> Result<(), StoreError>;

/// Thread-safe in-process table
#[derive(Debug)]
pub struct MemoryStore {
    table: Mutex<Table>,
    unique_constraint: bool,
    rejected_codes: HashSet<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty table with a unique constraint on `(trust_code, period)`
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            unique_constraint: true,
            rejected_codes: HashSet::new(),
        }
    }

    /// Table without the unique constraint; upserts fail with `ConflictTargetMissing`
    pub fn without_unique_constraint() -> Self {
        Self {
            unique_constraint: false,
            ..Self::new()
        }
    }

    /// Any batch containing this trust code fails as a whole
    pub fn reject_trust_code(mut self, code: impl Into<String>) -> Self {
        self.rejected_codes.insert(code.into());
        self
    }

    fn with_rows(rows: Vec<TrustPeriodRecord>) -> Self {
        Self {
            table: Mutex::new(Table::with_rows(rows)),
            ..Self::new()
        }
    }

    /// Every stored row in write order
    pub fn records(&self) -> Vec<TrustPeriodRecord> {
        self.table.lock().rows.clone()
    }

    pub fn get(&self, key: &RecordKey) -> Option<TrustPeriodRecord> {
        let table = self.table.lock();
        table.position(key).map(|i| table.rows[i].clone())
    }

    /// Log of every write call, failed ones included
    pub fn operations(&self) -> Vec<StoreOperation> {
        self.table.lock().operations.clone()
    }

    fn check_rejections(&self, records: &[TrustPeriodRecord]) -> Result<(), StoreError> {
        match records.iter().find(|r| self.rejected_codes.contains(&r.trust_code)) {
            Some(record) => Err(StoreError::new(
                StoreErrorCode::Validation,
                format!("row {} violates a check constraint", record.key()),
            )),
            None => Ok(()),
        }
    }

    fn apply_upsert(&self, table: &mut Table, records: &[TrustPeriodRecord], conflict_target: &[&str]) -> Result<usize, StoreError> {
        if !self.unique_constraint {
            return Err(StoreError::new(
                StoreErrorCode::ConflictTargetMissing,
                "there is no unique or exclusion constraint matching the ON CONFLICT specification",
            ));
        }
        if conflict_target != CONFLICT_TARGET {
            return Err(StoreError::new(
                StoreErrorCode::ConflictTargetMissing,
                format!("no unique constraint on ({})", conflict_target.join(", ")),
            ));
        }
        self.check_rejections(records)?;

        for record in records {
            match table.position(&record.key()) {
                Some(i) => table.rows[i] = record.clone(),
                None => table.push(record.clone()),
            }
        }
        Ok(records.len())
    }

    fn apply_insert(&self, table: &mut Table, records: &[TrustPeriodRecord]) -> Result<usize, StoreError> {
        self.check_rejections(records)?;

        if self.unique_constraint {
            let mut seen = HashSet::new();
            for record in records {
                let key = record.key();
                if table.position(&key).is_some() || !seen.insert(key.clone()) {
                    return Err(StoreError::new(
                        StoreErrorCode::Conflict,
                        format!("duplicate key value violates unique constraint: {}", key),
                    ));
                }
            }
        }
        for record in records {
            table.push(record.clone());
        }
        Ok(records.len())
    }

    /// Apply one write call under the table lock and log it
    fn write(
        &self,
        kind: OperationKind,
        records: &[TrustPeriodRecord],
        conflict_target: Option<&[&str]>,
        commit: Option<CommitHook<'_>>,
    ) -> Result<usize, StoreError> {
        let mut table = self.table.lock();
        let previous = commit.map(|_| table.rows.clone());

        let mut result = match conflict_target {
            Some(target) => self.apply_upsert(&mut table, records, target),
            None => self.apply_insert(&mut table, records),
        };
        if let (true, Some(commit)) = (result.is_ok(), commit) {
            if let Err(e) = commit(&table.rows) {
                if let Some(rows) = previous {
                    table.replace_rows(rows);
                }
                result = Err(e);
            }
        }

        table.operations.push(StoreOperation { kind, size: records.len(), succeeded: result.is_ok() });
        result
    }
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert(&self, records: &[TrustPeriodRecord], conflict_target: &[&str]) -> Result<usize, StoreError> {
        self.write(OperationKind::Upsert, records, Some(conflict_target), None)
    }

    fn insert(&self, records: &[TrustPeriodRecord]) -> Result<usize, StoreError> {
        self.write(OperationKind::Insert, records, None, None)
    }

    fn sample(&self, limit: usize) -> Result<Vec<serde_json::Value>, StoreError> {
        self.table.lock().rows.iter()
            .take(limit)
            .map(|r| serde_json::to_value(r).map_err(|e| StoreError::new(StoreErrorCode::Internal, e.to_string())))
            .collect()
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.table.lock().rows.len())
    }
}

/// Table persisted to a JSON file after every successful write
///
/// The file is rewritten while the table lock is held, so concurrent writers
/// reach the disk in the same order they changed the table. A write whose
/// file update fails is undone in memory too.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: MemoryStore,
}

impl JsonFileStore {
    /// Open the table file, creating an empty table when it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rows: Vec<TrustPeriodRecord> = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents).map_err(|e| PipelineError::Configuration {
                    message: format!("Store file {} is not a record table: {}", path.display(), e),
                    suggestion: Some("Point NHS_STORE_FILE at a new file or delete the corrupt one".to_string()),
                })?
            }
        } else {
            Vec::new()
        };
        log::debug!("Opened file store {} with {} rows", path.display(), rows.len());
        Ok(Self {
            path,
            table: MemoryStore::with_rows(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> Vec<TrustPeriodRecord> {
        self.table.records()
    }

    fn persist(&self, rows: &[TrustPeriodRecord]) -> Result<(), StoreError> {
        write_table_file(&self.path, rows)
    }
}

/// Write via a uniquely named temporary file and rename so readers never see a partial table
fn write_table_file(path: &Path, rows: &[TrustPeriodRecord]) -> Result<(), StoreError> {
    let io_error = |e: std::io::Error| StoreError::new(StoreErrorCode::Io, format!("{}: {}", path.display(), e));

    let json = serde_json::to_vec_pretty(rows)
        .map_err(|e| StoreError::new(StoreErrorCode::Internal, e.to_string()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_error)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error)?;
    tmp.write_all(&json).map_err(io_error)?;
    tmp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

impl RecordStore for JsonFileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn upsert(&self, records: &[TrustPeriodRecord], conflict_target: &[&str]) -> Result<usize, StoreError> {
        let persist = |rows: &[TrustPeriodRecord]| self.persist(rows);
        self.table.write(OperationKind::Upsert, records, Some(conflict_target), Some(&persist))
    }

    fn insert(&self, records: &[TrustPeriodRecord]) -> Result<usize, StoreError> {
        let persist = |rows: &[TrustPeriodRecord]| self.persist(rows);
        self.table.write(OperationKind::Insert, records, None, Some(&persist))
    }

    fn sample(&self, limit: usize) -> Result<Vec<serde_json::Value>, StoreError> {
        self.table.sample(limit)
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.table.count()
    }
}

#[cfg(feature = "remote")]
pub use remote::RestStore;

#[cfg(feature = "remote")]
mod remote {
    use reqwest::blocking::{Client, RequestBuilder, Response};
    use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
    use reqwest::StatusCode;
    use serde::Deserialize;

    use super::{RecordStore, StoreError, StoreErrorCode};
    use crate::config::StoreConfig;
    use crate::data_types::TrustPeriodRecord;
    use crate::PipelineError;

    /// PostgreSQL error codes surfaced through the REST layer
    const PG_NO_CONFLICT_CONSTRAINT: &str = "42P10";
    const PG_UNIQUE_VIOLATION: &str = "23505";

    #[derive(Debug, Default, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    /// PostgREST-compatible hosted table
    pub struct RestStore {
        base_url: String,
        key: String,
        table: String,
        client: Client,
    }

    impl std::fmt::Debug for RestStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RestStore")
                .field("base_url", &self.base_url)
                .field("table", &self.table)
                .finish()
        }
    }

    impl RestStore {
        /// Client for `<base_url>/rest/v1/<table>`; fails when no HTTP client can be built
        pub fn new(base_url: impl Into<String>, key: impl Into<String>, table: impl Into<String>) -> crate::Result<Self> {
            let client = Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| PipelineError::Configuration {
                    message: format!("Cannot build the HTTP client for the rest store: {}", e),
                    suggestion: Some("Check the TLS setup of this machine".to_string()),
                })?;
            Ok(Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                key: key.into(),
                table: table.into(),
                client,
            })
        }

        /// Build from configuration; missing URL or key is fatal
        pub fn from_config(config: &StoreConfig) -> crate::Result<Self> {
            let (url, key) = config.credentials()?;
            Self::new(url, key, config.table.clone())
        }

        fn table_url(&self) -> String {
            format!("{}/rest/v1/{}", self.base_url, self.table)
        }

        fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
            req.header("apikey", &self.key)
                .header(AUTHORIZATION, format!("Bearer {}", self.key))
        }

        fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
            let response = self.authorized(req)
                .send()
                .map_err(|e| StoreError::new(StoreErrorCode::Network, e.to_string()))?;
            if response.status().is_success() {
                Ok(response)
            } else {
                Err(error_from_response(response))
            }
        }

        fn post(&self, records: &[TrustPeriodRecord], on_conflict: Option<&[&str]>) -> Result<usize, StoreError> {
            if records.is_empty() {
                return Ok(0);
            }
            let mut req = self.client.post(self.table_url())
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .json(records);
            req = match on_conflict {
                Some(target) => req
                    .query(&[("on_conflict", target.join(","))])
                    .header("Prefer", "resolution=merge-duplicates,return=minimal"),
                None => req.header("Prefer", "return=minimal"),
            };
            self.send(req)?;
            Ok(records.len())
        }
    }

    fn error_from_response(response: Response) -> StoreError {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = parsed.message.unwrap_or_else(|| body.clone());

        let code = match parsed.code.as_deref() {
            Some(PG_NO_CONFLICT_CONSTRAINT) => StoreErrorCode::ConflictTargetMissing,
            Some(PG_UNIQUE_VIOLATION) => StoreErrorCode::Conflict,
            _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                StoreErrorCode::Unauthorized
            }
            _ if status == StatusCode::CONFLICT => StoreErrorCode::Conflict,
            _ if status.is_client_error() => StoreErrorCode::Validation,
            _ => StoreErrorCode::Internal,
        };
        StoreError::new(code, format!("HTTP {}: {}", status.as_u16(), message))
    }

    /// Total from a `Content-Range` value such as `0-0/42` or `*/0`
    pub(super) fn parse_content_range_total(value: &str) -> Option<usize> {
        value.rsplit('/').next()?.trim().parse().ok()
    }

    impl RecordStore for RestStore {
        fn name(&self) -> &str {
            "rest"
        }

        fn upsert(&self, records: &[TrustPeriodRecord], conflict_target: &[&str]) -> Result<usize, StoreError> {
            self.post(records, Some(conflict_target))
        }

        fn insert(&self, records: &[TrustPeriodRecord]) -> Result<usize, StoreError> {
            self.post(records, None)
        }

        fn sample(&self, limit: usize) -> Result<Vec<serde_json::Value>, StoreError> {
            let req = self.client.get(self.table_url())
                .query(&[("select", "*".to_string()), ("limit", limit.to_string())]);
            self.send(req)?
                .json()
                .map_err(|e| StoreError::new(StoreErrorCode::Validation, e.to_string()))
        }

        fn count(&self) -> Result<usize, StoreError> {
            let req = self.client.get(self.table_url())
                .query(&[("select", "trust_code")])
                .header("Prefer", "count=exact")
                .header("Range", "0-0");
            let response = self.send(req)?;
            response.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| StoreError::new(StoreErrorCode::Validation, "response has no Content-Range total"))
        }
    }
}

/// Open the store named by the configuration
pub fn open_store(config: &StoreConfig) -> crate::Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => Ok(Arc::new(JsonFileStore::open(&config.file_path)?)),
        #[cfg(feature = "remote")]
        StoreBackend::Rest => Ok(Arc::new(RestStore::from_config(config)?)),
        #[cfg(not(feature = "remote"))]
        StoreBackend::Rest => {
            // credentials are still checked first so setup errors read the same
            config.credentials()?;
            Err(PipelineError::Configuration {
                message: "The rest store backend is not compiled in".to_string(),
                suggestion: Some("Rebuild with `--features remote`".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, period: &str, name: &str) -> TrustPeriodRecord {
        TrustPeriodRecord {
            trust_code: code.to_string(),
            trust_name: Some(name.to_string()),
            period: period.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_is_idempotent_and_last_write_wins() {
        let store = MemoryStore::new();
        store.upsert(&[record("R0A", "2025-01-01", "First")], CONFLICT_TARGET).unwrap();
        store.upsert(&[record("R0A", "2025-01-01", "Second")], CONFLICT_TARGET).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(&record("R0A", "2025-01-01", "").key()).unwrap();
        assert_eq!(stored.trust_name.as_deref(), Some("Second"));
    }

    #[test]
    fn test_upsert_without_constraint() {
        let store = MemoryStore::without_unique_constraint();
        let err = store.upsert(&[record("R0A", "2025-01-01", "A")], CONFLICT_TARGET).unwrap_err();
        assert_eq!(err.code, StoreErrorCode::ConflictTargetMissing);
        assert_eq!(store.insert(&[record("R0A", "2025-01-01", "A")]).unwrap(), 1);
        assert_eq!(store.insert(&[record("R0A", "2025-01-01", "A")]).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_rejected_record_fails_whole_batch() {
        let store = MemoryStore::new().reject_trust_code("BAD");
        let batch = vec![record("R0A", "2025-01-01", "A"), record("BAD", "2025-01-01", "B")];
        let err = store.upsert(&batch, CONFLICT_TARGET).unwrap_err();
        assert_eq!(err.code, StoreErrorCode::Validation);
        assert_eq!(store.count().unwrap(), 0);

        assert!(store.insert(&batch[..1]).is_ok());
        assert!(store.insert(&batch[1..]).is_err());
        assert_eq!(store.count().unwrap(), 1);

        let ops = store.operations();
        assert_eq!(ops.len(), 3);
        assert!(!ops[0].succeeded);
        assert_eq!(ops[1].kind, OperationKind::Insert);
    }

    #[test]
    fn test_insert_conflict_with_constraint() {
        let store = MemoryStore::new();
        store.insert(&[record("R0A", "2025-01-01", "A")]).unwrap();
        let err = store.insert(&[record("R0A", "2025-01-01", "A")]).unwrap_err();
        assert_eq!(err.code, StoreErrorCode::Conflict);
    }

    #[test]
    fn test_sample_returns_json_objects() {
        let store = MemoryStore::new();
        let mut r = record("R0A", "2025-01-01", "A");
        r.ae_data = Some(crate::data_types::MetricGroup::from_pairs([("attendances_total", Some(1.0))]));
        store.upsert(&[r], CONFLICT_TARGET).unwrap();
        let rows = store.sample(5).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["ae_data"].is_object());
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.upsert(&[record("R0A", "2025-01-01", "A"), record("RJ1", "2025-01-01", "B")], CONFLICT_TARGET).unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        reopened.upsert(&[record("R0A", "2025-01-01", "C")], CONFLICT_TARGET).unwrap();
        assert_eq!(JsonFileStore::open(&path).unwrap().count().unwrap(), 2);
    }

    #[test]
    fn test_file_store_concurrent_writers_match_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        let store = JsonFileStore::open(&path).unwrap();

        let failures: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|worker| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..50)
                            .filter(|i| {
                                let code = format!("R{}{:02}", worker, i);
                                store.upsert(&[record(&code, "2025-01-01", "T")], CONFLICT_TARGET).is_err()
                            })
                            .count()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(failures, 0);
        assert_eq!(store.count().unwrap(), 200);
        assert_eq!(JsonFileStore::open(&path).unwrap().count().unwrap(), 200);
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_file_store_failed_write_is_undone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.upsert(&[record("R0A", "2025-01-01", "A")], CONFLICT_TARGET).unwrap();

        // a directory in place of the table file makes the rename fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let err = store.upsert(&[record("R0A", "2025-01-01", "B"), record("RJ1", "2025-01-01", "C")], CONFLICT_TARGET).unwrap_err();
        assert_eq!(err.code, StoreErrorCode::Io);
        assert!(store.insert(&[record("RJ2", "2025-01-01", "D")]).is_err());

        assert_eq!(store.count().unwrap(), 1);
        let kept = store.table.get(&record("R0A", "2025-01-01", "").key()).unwrap();
        assert_eq!(kept.trust_name.as_deref(), Some("A"));
        assert!(store.table.get(&record("RJ1", "2025-01-01", "").key()).is_none());
    }

    #[test]
    fn test_key_lookup_follows_writes() {
        let rows: Vec<_> = (0..100).map(|i| record(&format!("R{:02}", i), "2025-01-01", "Old")).collect();
        let store = MemoryStore::with_rows(rows);
        store.upsert(&[record("R42", "2025-01-01", "New"), record("R42", "2025-02-01", "Feb")], CONFLICT_TARGET).unwrap();

        assert_eq!(store.count().unwrap(), 101);
        assert_eq!(store.get(&record("R42", "2025-01-01", "").key()).unwrap().trust_name.as_deref(), Some("New"));
        assert_eq!(store.get(&record("R42", "2025-02-01", "").key()).unwrap().trust_name.as_deref(), Some("Feb"));
        assert_eq!(store.records()[100].period, "2025-02-01");

        // without the constraint, lookups keep returning the first copy
        let loose = MemoryStore::without_unique_constraint();
        loose.insert(&[record("R0A", "2025-01-01", "First")]).unwrap();
        loose.insert(&[record("R0A", "2025-01-01", "Second")]).unwrap();
        assert_eq!(loose.get(&record("R0A", "2025-01-01", "").key()).unwrap().trust_name.as_deref(), Some("First"));
    }

    #[test]
    fn test_open_store_rest_requires_credentials() {
        let config = StoreConfig { backend: StoreBackend::Rest, ..StoreConfig::default() };
        assert!(matches!(open_store(&config), Err(PipelineError::MissingCredentials { .. })));
    }

    #[cfg(feature = "remote")]
    #[test]
    fn test_rest_store_trims_base_url() {
        let store = RestStore::new("https://example.test/", "key", "trust_metrics").unwrap();
        assert!(format!("{:?}", store).contains("\"https://example.test\""));
    }

    #[cfg(feature = "remote")]
    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(remote::parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(remote::parse_content_range_total("*/0"), Some(0));
        assert_eq!(remote::parse_content_range_total("0-0/*"), None);
    }
}
