/*!
 * Export functionality for trust-period records
 *
 * Provides JSON, JSON Lines and PostgreSQL upsert script output for
 * accepted records, used for dry runs and for loading a database offline.
 */

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::constants::{CONFLICT_TARGET, DEFAULT_TABLE};
use crate::data_types::{RecordKey, TrustPeriodRecord};
use crate::{ExportFormat, Result};

/// Trait for implementing record exporters
pub trait RecordExporter {
    /// Export the records
    fn export(&self, records: &[TrustPeriodRecord], path: &Path) -> Result<()>;

    /// Get the export format
    fn format(&self) -> ExportFormat;
}

/// JSON exporter for trust-period records
pub struct JsonExporter {
    /// Whether to pretty-print the JSON
    pub pretty_print: bool,
    /// Whether to export as JSON Lines (one record per line)
    pub json_lines: bool,
}

impl Default for JsonExporter {
    fn default() -> Self {
        Self {
            pretty_print: true,
            json_lines: false,
        }
    }
}

impl JsonExporter {
    /// Create a new JSON exporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pretty printing
    pub fn with_pretty_print(mut self, pretty: bool) -> Self {
        self.pretty_print = pretty;
        self
    }

    /// Set JSON Lines format
    pub fn as_json_lines(mut self) -> Self {
        self.json_lines = true;
        self.pretty_print = false;
        self
    }
}

impl RecordExporter for JsonExporter {
    fn export(&self, records: &[TrustPeriodRecord], path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        if self.json_lines {
            for record in records {
                let json = serde_json::to_string(record)?;
                writeln!(writer, "{}", json)?;
            }
        } else if self.pretty_print {
            serde_json::to_writer_pretty(&mut writer, records)?;
        } else {
            serde_json::to_writer(&mut writer, records)?;
        }

        writer.flush()?;
        Ok(())
    }

    fn format(&self) -> ExportFormat {
        if self.json_lines {
            ExportFormat::JsonLines
        } else {
            ExportFormat::Json
        }
    }
}

/// PostgreSQL upsert script exporter
pub struct SqlExporter {
    /// Target table
    pub table: String,
    /// Rows per INSERT statement
    pub batch_size: usize,
    /// Whether to include the CREATE TABLE statement
    pub include_schema: bool,
}

impl Default for SqlExporter {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            batch_size: 1000,
            include_schema: true,
        }
    }
}

impl SqlExporter {
    /// Create a new SQL exporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set rows per INSERT statement
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_schema(mut self, include: bool) -> Self {
        self.include_schema = include;
        self
    }

    fn write_schema(&self, writer: &mut dyn Write) -> Result<()> {
        writeln!(writer, "-- Trust metrics schema for PostgreSQL\n")?;
        writeln!(writer, "CREATE TABLE IF NOT EXISTS {} (", self.table)?;
        writeln!(writer, "  trust_code VARCHAR(3) NOT NULL,")?;
        writeln!(writer, "  trust_name TEXT,")?;
        writeln!(writer, "  period DATE NOT NULL,")?;
        writeln!(writer, "  icb_code VARCHAR(10),")?;
        writeln!(writer, "  icb_name TEXT,")?;
        writeln!(writer, "  rtt_data JSONB,")?;
        writeln!(writer, "  ae_data JSONB,")?;
        writeln!(writer, "  diagnostics_data JSONB,")?;
        writeln!(writer, "  capacity_data JSONB,")?;
        writeln!(writer, "  updated_at TIMESTAMPTZ DEFAULT NOW(),")?;
        writeln!(writer, "  UNIQUE ({})", CONFLICT_TARGET.join(", "))?;
        writeln!(writer, ");\n")?;
        writeln!(writer, "CREATE INDEX IF NOT EXISTS idx_{}_period ON {}(period);\n", self.table, self.table)?;
        Ok(())
    }

    fn write_upserts(&self, writer: &mut dyn Write, records: &[&TrustPeriodRecord]) -> Result<()> {
        for chunk in records.chunks(self.batch_size.max(1)) {
            writeln!(
                writer,
                "INSERT INTO {} (trust_code, trust_name, period, icb_code, icb_name, rtt_data, ae_data, diagnostics_data, capacity_data) VALUES",
                self.table
            )?;

            for (i, record) in chunk.iter().enumerate() {
                let values = format!(
                    "({}, {}, {}, {}, {}, {}, {}, {}, {})",
                    sql_text(&record.trust_code),
                    sql_string(&record.trust_name),
                    sql_text(&record.period),
                    sql_string(&record.icb_code),
                    sql_string(&record.icb_name),
                    sql_jsonb(&record.rtt_data)?,
                    sql_jsonb(&record.ae_data)?,
                    sql_jsonb(&record.diagnostics_data)?,
                    sql_jsonb(&record.capacity_data)?,
                );
                let separator = if i + 1 < chunk.len() { "," } else { "" };
                writeln!(writer, "  {}{}", values, separator)?;
            }

            writeln!(writer, "ON CONFLICT ({}) DO UPDATE SET", CONFLICT_TARGET.join(", "))?;
            writeln!(writer, "  trust_name = EXCLUDED.trust_name,")?;
            writeln!(writer, "  icb_code = EXCLUDED.icb_code,")?;
            writeln!(writer, "  icb_name = EXCLUDED.icb_name,")?;
            writeln!(writer, "  rtt_data = EXCLUDED.rtt_data,")?;
            writeln!(writer, "  ae_data = EXCLUDED.ae_data,")?;
            writeln!(writer, "  diagnostics_data = EXCLUDED.diagnostics_data,")?;
            writeln!(writer, "  capacity_data = EXCLUDED.capacity_data,")?;
            writeln!(writer, "  updated_at = NOW();\n")?;
        }
        Ok(())
    }
}

impl RecordExporter for SqlExporter {
    fn export(&self, records: &[TrustPeriodRecord], path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        if self.include_schema {
            self.write_schema(&mut writer)?;
        }

        let latest = latest_per_key(records);
        writeln!(writer, "-- {} trust-period records", latest.len())?;
        self.write_upserts(&mut writer, &latest)?;
        writer.flush()?;

        Ok(())
    }

    fn format(&self) -> ExportFormat {
        ExportFormat::Sql
    }
}

/// Exporter with default settings for a format
pub fn exporter_for(format: ExportFormat) -> Box<dyn RecordExporter> {
    match format {
        ExportFormat::Json => Box::new(JsonExporter::new()),
        ExportFormat::JsonLines => Box::new(JsonExporter::new().as_json_lines()),
        ExportFormat::Sql => Box::new(SqlExporter::new()),
    }
}

/// One record per `(trust_code, period)`: first-seen order, last-seen values
fn latest_per_key(records: &[TrustPeriodRecord]) -> Vec<&TrustPeriodRecord> {
    let mut slots: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());
    let mut latest: Vec<&TrustPeriodRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.entry(record.key()) {
            Entry::Occupied(slot) => latest[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

// SQL helper functions
fn sql_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn sql_string(opt: &Option<String>) -> String {
    match opt {
        Some(s) => sql_text(s),
        None => "NULL".to_string(),
    }
}

fn sql_jsonb<T: serde::Serialize>(opt: &Option<T>) -> Result<String> {
    match opt {
        Some(value) => Ok(format!("{}::jsonb", sql_text(&serde_json::to_string(value)?))),
        None => Ok("NULL".to_string()),
    }
}
