/*!
 * Tender normalization
 *
 * Procurement exports disagree on where the classification lives: some
 * carry a plain string, some a JSON object with a confidence score, some a
 * separate `category` column. Everything is normalized into one [`Tender`]
 * shape with a fixed precedence:
 *
 * nested object `classification` > flat string > `category` > none
 *
 * Empty strings count as absent at every level.
 */

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{ErrorContext, PipelineError, Result};

/// Canonical tender record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    pub id: String,
    pub title: Option<String>,
    pub buyer: Option<String>,
    pub value: Option<f64>,
    pub published: Option<NaiveDate>,
    pub classification: Option<String>,
    pub classification_confidence: Option<f64>,
}

/// One tender row as exported, before normalization
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTender {
    #[serde(default, alias = "tender_id", alias = "ocid")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "buyer_name")]
    pub buyer: Option<String>,
    #[serde(default, alias = "value_amount")]
    pub value: Option<String>,
    #[serde(default, alias = "published_date")]
    pub published: Option<String>,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Shapes the `classification` cell can take
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawClassification {
    Nested {
        #[serde(default)]
        classification: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },
    Flat(String),
}

impl RawClassification {
    /// Parse a cell; anything that is not a JSON object is a flat label
    pub fn parse(cell: &str) -> Result<Self> {
        let cell = cell.trim();
        if cell.starts_with('{') {
            serde_json::from_str(cell).map_err(|e| PipelineError::DataValidation {
                message: format!("Malformed classification object: {}", e),
                field: Some("classification".to_string()),
                value: Some(cell.to_string()),
                context: ErrorContext::default(),
            })
        } else {
            Ok(Self::Flat(cell.to_string()))
        }
    }
}

/// Result of reading a tender export
#[derive(Debug, Default)]
pub struct TenderBatch {
    pub tenders: Vec<Tender>,
    /// Rows without an id
    pub skipped: usize,
    /// Rows that had an id but could not be normalized
    pub errors: Vec<PipelineError>,
}

impl TenderBatch {
    pub fn rows_read(&self) -> usize {
        self.tenders.len() + self.skipped + self.errors.len()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Normalize one raw tender
pub fn normalize_tender(raw: &RawTender) -> Result<Tender> {
    let id = present(&raw.id).ok_or_else(|| PipelineError::DataValidation {
        message: "Tender has no id".to_string(),
        field: Some("id".to_string()),
        value: None,
        context: ErrorContext::default(),
    })?;

    let nested = match present(&raw.classification) {
        Some(cell) => Some(RawClassification::parse(cell)?),
        None => None,
    };

    let (classification, classification_confidence) = match nested {
        Some(RawClassification::Nested { classification, confidence }) => match present(&classification) {
            Some(label) => (Some(label.to_string()), confidence),
            None => (present(&raw.category).map(str::to_string), None),
        },
        Some(RawClassification::Flat(label)) => (Some(label), None),
        None => (present(&raw.category).map(str::to_string), None),
    };

    Ok(Tender {
        id: id.to_string(),
        title: present(&raw.title).map(str::to_string),
        buyer: present(&raw.buyer).map(str::to_string),
        value: present(&raw.value).and_then(parse_value),
        published: present(&raw.published).and_then(parse_published),
        classification,
        classification_confidence,
    })
}

/// Read and normalize every tender in a CSV export
pub fn read_tenders<P: AsRef<Path>>(path: P) -> Result<TenderBatch> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipelineError::file_not_found_with_suggestion(path.to_path_buf()));
    }

    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file);

    let mut batch = TenderBatch::default();
    for (index, row) in reader.deserialize::<RawTender>().enumerate() {
        let line = index + 2;
        let raw = match row {
            Ok(raw) => raw,
            Err(e) => {
                batch.errors.push(PipelineError::CsvParse {
                    message: e.to_string(),
                    line: Some(line),
                    column: None,
                    context: ErrorContext::default(),
                });
                continue;
            }
        };

        if present(&raw.id).is_none() {
            batch.skipped += 1;
            continue;
        }

        match normalize_tender(&raw) {
            Ok(tender) => batch.tenders.push(tender),
            Err(e) => {
                log::warn!("TENDER_REJECTED line={} reason={}", line, e);
                batch.errors.push(with_location(e, path, line));
            }
        }
    }

    log::info!(
        "TENDERS_READ source={} normalized={} skipped={} failed={}",
        path.display(),
        batch.tenders.len(),
        batch.skipped,
        batch.errors.len()
    );
    Ok(batch)
}

fn with_location(error: PipelineError, path: &Path, line: usize) -> PipelineError {
    match error {
        PipelineError::DataValidation { message, field, value, .. } => PipelineError::DataValidation {
            message,
            context: ErrorContext {
                file_path: Some(path.to_path_buf()),
                line_number: Some(line),
                column_name: field.clone(),
                ..Default::default()
            },
            field,
            value,
        },
        other => other,
    }
}

fn parse_value(value: &str) -> Option<f64> {
    let cleaned: String = value.chars().filter(|c| !matches!(c, ',' | '£' | ' ')).collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn parse_published(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
}
