/*!
 * Streaming CSV reader for NHS trust performance exports
 *
 * This module reads the header row for the pre-check and then yields one
 * [`SourceRow`] per data line. Malformed lines surface as per-row errors so
 * the caller can count them and keep going.
 */

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::{data_types::SourceRow, ErrorContext, PipelineError, Result};

/// Row-by-row reader over one CSV export
pub struct CsvSource {
    path: PathBuf,
    headers: StringRecord,
    records: StringRecordsIntoIter<File>,
    file_size: u64,
    rows_read: usize,
    started: Instant,
    #[cfg(feature = "progress")]
    progress_bar: Option<ProgressBar>,
}

impl std::fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSource")
            .field("path", &self.path)
            .field("columns", &self.headers.len())
            .field("rows_read", &self.rows_read)
            .finish()
    }
}

impl CsvSource {
    /// Read only the header row of a CSV file
    pub fn read_headers<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
        Ok(Self::open(path)?.headers())
    }

    /// Open a CSV file and read its header row
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PipelineError::file_not_found_with_suggestion(path.to_path_buf()));
        }

        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(file);

        let headers = reader.headers()
            .map_err(|e| PipelineError::CsvParse {
                message: format!("Could not read header row: {}", e),
                line: Some(1),
                column: None,
                context: ErrorContext {
                    file_path: Some(path.to_path_buf()),
                    line_number: Some(1),
                    ..Default::default()
                },
            })?
            .clone();

        log::debug!(
            "Opened {} ({}, {} columns)",
            path.display(),
            format_bytes(file_size as usize),
            headers.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            records: reader.into_records(),
            file_size,
            rows_read: 0,
            started: Instant::now(),
            #[cfg(feature = "progress")]
            progress_bar: None,
        })
    }

    /// Show a byte-based progress bar while rows are read
    #[cfg(feature = "progress")]
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.progress_bar = if show {
            let pb = ProgressBar::new(self.file_size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };
        self
    }

    /// Progress output is not compiled in
    #[cfg(not(feature = "progress"))]
    pub fn with_progress_bar(self, _show: bool) -> Self {
        self
    }

    /// Header names, trimmed
    pub fn headers(&self) -> Vec<String> {
        self.headers.iter().map(|h| h.to_string()).collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data lines consumed so far, malformed ones included
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// Rows per second since the file was opened
    pub fn rows_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.rows_read as f64 / elapsed
        } else {
            0.0
        }
    }

    fn finish_progress(&mut self) {
        #[cfg(feature = "progress")]
        if let Some(pb) = self.progress_bar.take() {
            pb.finish_with_message("Reading complete");
        }
    }
}

impl Iterator for CsvSource {
    type Item = Result<SourceRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match self.records.next() {
            Some(result) => result,
            None => {
                self.finish_progress();
                return None;
            }
        };

        self.rows_read += 1;
        let line = self.rows_read;

        #[cfg(feature = "progress")]
        if let Some(ref pb) = self.progress_bar {
            pb.set_position(self.records.reader().position().byte().min(self.file_size));
        }

        Some(match result {
            Ok(record) => Ok(SourceRow::from_record(line, &self.headers, &record)),
            Err(e) => Err(PipelineError::CsvParse {
                message: format!("CSV error: {}", e),
                line: Some(line),
                column: None,
                context: ErrorContext {
                    file_path: Some(self.path.clone()),
                    line_number: e.position().map(|p| p.line() as usize),
                    ..Default::default()
                },
            }),
        })
    }
}

// Helper functions

/// Format bytes into human-readable string
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_headers_trims() {
        let file = write_csv(" trust_code , period\nR0A,2025-01-01\n");
        let headers = CsvSource::read_headers(file.path()).unwrap();
        assert_eq!(headers, vec!["trust_code", "period"]);
    }

    #[test]
    fn test_rows_are_numbered_from_one() {
        let file = write_csv("trust_code,period\nR0A,2025-01-01\nRJ1,2025-02-01\n");
        let source = CsvSource::open(file.path()).unwrap().with_progress_bar(false);
        let rows: Vec<SourceRow> = source.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line, 1);
        assert_eq!(rows[1].get("trust_code"), Some("RJ1"));
    }

    #[test]
    fn test_malformed_line_is_a_row_error() {
        let file = write_csv("trust_code,period\nR0A,2025-01-01\nRJ1\nRXX,2025-03-01\n");
        let mut source = CsvSource::open(file.path()).unwrap().with_progress_bar(false);
        assert!(source.next().unwrap().is_ok());
        assert!(matches!(source.next().unwrap(), Err(PipelineError::CsvParse { line: Some(2), .. })));
        assert!(source.next().unwrap().is_ok());
        assert!(source.next().is_none());
        assert_eq!(source.rows_read(), 3);
    }

    #[test]
    fn test_throughput_counts_consumed_rows() {
        let file = write_csv("trust_code,period\nR0A,2025-01-01\nRJ1,2025-02-01\n");
        let mut source = CsvSource::open(file.path()).unwrap().with_progress_bar(false);
        assert_eq!(source.rows_per_second(), 0.0);
        assert_eq!(source.by_ref().count(), 2);
        assert!(source.rows_per_second() > 0.0);
    }

    #[test]
    fn test_missing_file() {
        let result = CsvSource::open("/definitely/not/here.csv");
        assert!(matches!(result, Err(PipelineError::FileNotFound { .. })));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
